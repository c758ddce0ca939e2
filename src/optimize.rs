//! Risk-adjusted allocation: maximize the annualized Sharpe ratio of the
//! portfolio value series under a `sum(|w|) == 1` budget and per-security
//! long/short bounds.
//!
//! The budget constraint and bounds are enforced by construction through a
//! bounded long/short parameterization of the weight vector (raw tanh
//! coordinates normalized by their absolute sum); the raw-space search runs
//! on argmin's Nelder-Mead executor. Any equivalent constrained nonlinear
//! solver produces comparable results for this objective.

use argmin::core::{CostFunction, Executor};
use argmin::solver::neldermead::NelderMead;
use tracing::{debug, info};

use crate::error::PortoptError;
use crate::series::PriceTable;

pub const DEFAULT_SAMPLES_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone)]
pub struct Optimizer {
    /// Capital allocated across the basket.
    pub start_value: f64,
    /// Annual risk-free rate as a fraction.
    pub risk_free_rate: f64,
    /// 252 for daily data, 52 weekly, 12 monthly.
    pub samples_per_year: f64,
    pub max_iters: u64,
}

impl Optimizer {
    pub fn new(start_value: f64, risk_free_rate: f64) -> Self {
        Self {
            start_value,
            risk_free_rate,
            samples_per_year: DEFAULT_SAMPLES_PER_YEAR,
            max_iters: 1000,
        }
    }
}

/// Solved weights, one per optimized column, plus summary statistics.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub codes: Vec<String>,
    pub weights: Vec<f64>,
    pub stats: PortfolioStats,
}

#[derive(Debug, Clone, Copy)]
pub struct PortfolioStats {
    pub cumulative_return: f64,
    pub avg_daily_return: f64,
    pub std_daily_return: f64,
    pub sharpe_ratio: f64,
}

/// Maps unconstrained raw coordinates into feasible weight vectors:
/// `sum(|w|) == 1`, shortable coordinates in (-1, 1), long-only in (0, 1).
#[derive(Debug, Clone)]
struct WeightMap {
    shortable: Vec<bool>,
}

impl WeightMap {
    fn weights(&self, raw: &[f64]) -> Vec<f64> {
        let v: Vec<f64> = raw
            .iter()
            .zip(&self.shortable)
            .map(|(x, &short)| {
                let t = x.tanh();
                if short { t } else { 0.5 * (t + 1.0) }
            })
            .collect();
        let abs_sum: f64 = v.iter().map(|x| x.abs()).sum();
        if abs_sum < 1e-12 {
            let n = v.len() as f64;
            self.shortable
                .iter()
                .map(|&short| if short { -1.0 / n } else { 1.0 / n })
                .collect()
        } else {
            v.iter().map(|x| x / abs_sum).collect()
        }
    }

    /// Raw coordinates whose image is the uniform-magnitude `1/n` start,
    /// negative in every shortable coordinate. Starting inside the short
    /// region aids budget-constraint satisfaction on long-short baskets.
    fn initial_raw(&self) -> Vec<f64> {
        let n = self.shortable.len() as f64;
        self.shortable
            .iter()
            .map(|&short| {
                let target = if short { -1.0 / n } else { 2.0 / n - 1.0 };
                target.clamp(-0.999, 0.999).atanh()
            })
            .collect()
    }
}

struct SharpeCost {
    base: Vec<Vec<f64>>,
    map: WeightMap,
    start_value: f64,
    period_risk_free: f64,
    annualization: f64,
}

impl CostFunction for SharpeCost {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, raw: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let weights = self.map.weights(raw);
        let values = daily_portfolio_values(&self.base, &weights, self.start_value);
        let returns = value_returns(&values);
        Ok(-sharpe_ratio(
            &returns,
            self.period_risk_free,
            self.annualization,
        ))
    }
}

impl Optimizer {
    /// Solves for the allocation maximizing the annualized Sharpe ratio of
    /// `prices` (one column per security, aligned and normalized).
    pub fn optimize(
        &self,
        prices: &PriceTable,
        shortable: &[bool],
    ) -> Result<Allocation, PortoptError> {
        let n = prices.n_cols();
        if n == 0 || shortable.len() != n {
            return Err(PortoptError::MisconfiguredPriceData(format!(
                "{} securities with {} bound flags",
                n,
                shortable.len()
            )));
        }
        let base = adjusted_base(prices)?;
        if base.len() < 3 {
            return Err(PortoptError::MisconfiguredPriceData(format!(
                "{} rows are not enough to compute return statistics",
                base.len()
            )));
        }

        let map = WeightMap {
            shortable: shortable.to_vec(),
        };
        let x0 = map.initial_raw();
        let mut simplex = Vec::with_capacity(n + 1);
        simplex.push(x0.clone());
        for i in 0..n {
            let mut point = x0.clone();
            point[i] += 1.0;
            simplex.push(point);
        }

        let cost = SharpeCost {
            base,
            map: map.clone(),
            start_value: self.start_value,
            period_risk_free: self.period_risk_free(),
            annualization: self.samples_per_year.sqrt(),
        };

        let solver = NelderMead::new(simplex)
            .with_sd_tolerance(1e-10)
            .map_err(|e| PortoptError::SolverDivergence(e.to_string()))?;
        let result = Executor::new(cost, solver)
            .configure(|state| state.max_iters(self.max_iters))
            .run()
            .map_err(|e| PortoptError::SolverDivergence(e.to_string()))?;
        debug!("Solver terminated: {:?}", result.state.termination_status);

        let best_raw = result
            .state
            .best_param
            .ok_or_else(|| PortoptError::SolverDivergence("solver returned no parameters".into()))?;
        let weights = map.weights(&best_raw);
        let stats = self.statistics(prices, &weights)?;
        info!("Optimization done, sharpe ratio {:.4}", stats.sharpe_ratio);

        Ok(Allocation {
            codes: prices.columns().to_vec(),
            weights,
            stats,
        })
    }

    /// Summary statistics of the portfolio value series under `weights`.
    pub fn statistics(
        &self,
        prices: &PriceTable,
        weights: &[f64],
    ) -> Result<PortfolioStats, PortoptError> {
        let base = adjusted_base(prices)?;
        let values = daily_portfolio_values(&base, weights, self.start_value);
        let returns = value_returns(&values);

        let cumulative_return = match (values.first(), values.last()) {
            (Some(first), Some(last)) if *first != 0.0 => last / first - 1.0,
            _ => 0.0,
        };
        Ok(PortfolioStats {
            cumulative_return,
            avg_daily_return: mean(&returns),
            std_daily_return: sample_std(&returns),
            sharpe_ratio: sharpe_ratio(
                &returns,
                self.period_risk_free(),
                self.samples_per_year.sqrt(),
            ),
        })
    }

    /// Period-equivalent of the annual risk-free rate.
    fn period_risk_free(&self) -> f64 {
        (1.0 + self.risk_free_rate).powf(1.0 / self.samples_per_year) - 1.0
    }
}

/// Dense base-1 matrix for the objective. A zero in the first row signals
/// returns data where prices were expected and is fatal; a first row that
/// is not all at the base 1 is re-normalized on a copy.
fn adjusted_base(prices: &PriceTable) -> Result<Vec<Vec<f64>>, PortoptError> {
    let mut dense = prices
        .dense()
        .map_err(PortoptError::MisconfiguredPriceData)?;
    let Some(first) = dense.first().cloned() else {
        return Err(PortoptError::MisconfiguredPriceData("empty matrix".into()));
    };

    if first.iter().any(|v| *v == 0.0) {
        return Err(PortoptError::MisconfiguredPriceData(format!(
            "normed prices are needed instead of daily returns:\n{}",
            prices.head(3)
        )));
    }
    if first.iter().any(|v| *v != 1.0) {
        for row in &mut dense {
            for (value, base) in row.iter_mut().zip(&first) {
                *value /= base;
            }
        }
    }
    Ok(dense)
}

/// Daily portfolio value under the sign trick: a security held short has
/// its base-1 series shifted down by 2, turning the position contribution
/// negative without breaking differentiability of the objective.
fn daily_portfolio_values(base: &[Vec<f64>], weights: &[f64], start_value: f64) -> Vec<f64> {
    base.iter()
        .map(|row| {
            row.iter()
                .zip(weights)
                .map(|(v, w)| {
                    let adjusted = if *w < 0.0 { v - 2.0 } else { *v };
                    adjusted * w * start_value
                })
                .sum()
        })
        .collect()
}

/// Daily returns of a value series with the always-zero first row dropped;
/// it would bias the mean and deflate the deviation.
fn value_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|pair| {
            if pair[0] == 0.0 {
                0.0
            } else {
                pair[1] / pair[0] - 1.0
            }
        })
        .collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

/// Annualized Sharpe ratio of a period-return series.
fn sharpe_ratio(returns: &[f64], period_risk_free: f64, annualization: f64) -> f64 {
    let excess: Vec<f64> = returns.iter().map(|r| r - period_risk_free).collect();
    let std = sample_std(&excess);
    if std < f64::EPSILON {
        return 0.0;
    }
    mean(&excess) / std * annualization
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quotes::PriceSeries;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn table(columns: &[(&str, &[f64])]) -> PriceTable {
        let n_rows = columns[0].1.len();
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let mut table = PriceTable::new(start, start + chrono::Days::new(n_rows as u64 - 1));
        for (code, values) in columns {
            let rows = values
                .iter()
                .enumerate()
                .map(|(i, v)| (start + chrono::Days::new(i as u64), *v, None))
                .collect();
            table.join(&PriceSeries {
                code: code.to_string(),
                has_volume: false,
                rows,
            });
        }
        table
    }

    #[test]
    fn sign_trick_shifts_short_positions_down_by_two() {
        let base = vec![vec![1.0, 1.0], vec![1.1, 0.9]];
        let values = daily_portfolio_values(&base, &[0.5, -0.5], 100.0);

        // long leg: 1.0*0.5*100 = 50; short leg: (1.0-2)*-0.5*100 = 50
        assert_relative_eq!(values[0], 100.0);
        // long leg: 1.1*0.5*100 = 55; short leg: (0.9-2)*-0.5*100 = 55
        assert_relative_eq!(values[1], 110.0);
    }

    #[test]
    fn returns_shaped_matrix_is_fatal() {
        let prices = table(&[("A", &[0.0, 0.01, -0.02])]);
        let err = adjusted_base(&prices).unwrap_err();
        assert!(matches!(err, PortoptError::MisconfiguredPriceData(_)));
        assert!(err.to_string().contains("A"));
    }

    #[test]
    fn non_base_one_matrix_is_renormalized() {
        let prices = table(&[("A", &[100.0, 110.0]), ("B", &[50.0, 45.0])]);
        let base = adjusted_base(&prices).unwrap();
        assert_relative_eq!(base[0][0], 1.0);
        assert_relative_eq!(base[0][1], 1.0);
        assert_relative_eq!(base[1][0], 1.1);
        assert_relative_eq!(base[1][1], 0.9);
    }

    #[test]
    fn sharpe_matches_hand_computation() {
        let returns = [0.01, 0.02, 0.015, -0.005];
        let rf = 0.0;
        let k = 252.0_f64.sqrt();
        let m = mean(&returns);
        let s = sample_std(&returns);
        assert_relative_eq!(sharpe_ratio(&returns, rf, k), m / s * k, epsilon = 1e-12);

        // a nonzero risk-free rate shifts the mean but not the deviation
        let prf = (1.0_f64 + 0.05).powf(1.0 / 252.0) - 1.0;
        assert_relative_eq!(
            sharpe_ratio(&returns, prf, k),
            (m - prf) / s * k,
            epsilon = 1e-12
        );
    }

    #[test]
    fn weight_map_starts_uniform_negative_where_short_is_allowed() {
        let map = WeightMap {
            shortable: vec![true, false, true],
        };
        let weights = map.weights(&map.initial_raw());
        assert_relative_eq!(weights[0], -1.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(weights[1], 1.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(weights[2], -1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn weight_map_image_is_always_feasible() {
        let map = WeightMap {
            shortable: vec![true, false, false, true],
        };
        for raw in [
            vec![0.3, -2.0, 5.0, 0.0],
            vec![-4.0, 0.0, 0.1, 2.0],
            vec![0.0, 0.0, 0.0, 0.0],
        ] {
            let w = map.weights(&raw);
            let budget: f64 = w.iter().map(|x| x.abs()).sum();
            assert_relative_eq!(budget, 1.0, epsilon = 1e-9);
            assert!(w[1] >= 0.0 && w[2] >= 0.0);
            assert!(w.iter().all(|x| x.abs() <= 1.0));
        }
    }

    fn trending_prices() -> PriceTable {
        // A drifts up steadily, B drifts down, C is choppy sideways.
        let a: Vec<f64> = (0..40).map(|i| 1.0 + 0.01 * i as f64).collect();
        let b: Vec<f64> = (0..40).map(|i| 1.0 - 0.005 * i as f64).collect();
        let c: Vec<f64> = (0..40)
            .map(|i| 1.0 + if i % 2 == 0 { 0.02 } else { -0.02 })
            .collect();
        table(&[("A", &a), ("B", &b), ("C", &c)])
    }

    #[test]
    fn solved_allocation_satisfies_budget_and_bounds() {
        let prices = trending_prices();
        let optimizer = Optimizer::new(1_000_000.0, 0.0);

        let shortable = [false, true, false];
        let allocation = optimizer.optimize(&prices, &shortable).unwrap();

        let budget: f64 = allocation.weights.iter().map(|w| w.abs()).sum();
        assert!((budget - 1.0).abs() < 1e-6);
        for (w, &short) in allocation.weights.iter().zip(&shortable) {
            if short {
                assert!((-1.0..=1.0).contains(w));
            } else {
                assert!((0.0..=1.0).contains(w));
            }
        }
        assert_eq!(allocation.codes, prices.columns());
    }

    #[test]
    fn solver_improves_on_the_initial_allocation() {
        let prices = trending_prices();
        let optimizer = Optimizer::new(1_000_000.0, 0.0);
        let allocation = optimizer
            .optimize(&prices, &[false, true, false])
            .unwrap();

        // Nelder-Mead keeps the best vertex, so the solve can never end up
        // worse than its own starting point (uniform magnitude, B short).
        let initial = optimizer
            .statistics(&prices, &[1.0 / 3.0, -1.0 / 3.0, 1.0 / 3.0])
            .unwrap();
        assert!(allocation.stats.sharpe_ratio >= initial.sharpe_ratio - 1e-9);
        assert!(allocation.stats.sharpe_ratio > 0.0);
    }

    #[test]
    fn statistics_of_uniform_long_allocation() {
        let prices = table(&[("A", &[1.0, 1.1, 1.21]), ("B", &[1.0, 1.1, 1.21])]);
        let optimizer = Optimizer::new(1000.0, 0.0);
        let stats = optimizer.statistics(&prices, &[0.5, 0.5]).unwrap();

        assert_relative_eq!(stats.cumulative_return, 0.21, epsilon = 1e-12);
        assert_relative_eq!(stats.avg_daily_return, 0.1, epsilon = 1e-12);
        assert_relative_eq!(stats.std_daily_return, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn too_short_series_is_rejected() {
        let prices = table(&[("A", &[1.0, 1.1])]);
        let optimizer = Optimizer::new(1000.0, 0.0);
        let err = optimizer.optimize(&prices, &[false]).unwrap_err();
        assert!(matches!(err, PortoptError::MisconfiguredPriceData(_)));
    }
}
