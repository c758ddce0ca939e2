use std::path::PathBuf;
use thiserror::Error;

/// Error kinds surfaced by the data and optimization pipeline.
///
/// Remote fetch failures are not retried here; a retry policy, if any,
/// belongs to the HTTP collaborator. Data-shape errors are fatal.
#[derive(Debug, Error)]
pub enum PortoptError {
    /// Remote catalog endpoint unreachable or malformed beyond repair.
    #[error("catalog fetch failed: {0}")]
    CatalogFetch(String),

    /// An explicit dated snapshot was requested but is absent locally.
    /// There is no auto-fetch fallback for dated queries.
    #[error("catalog snapshot not found: {}", .0.display())]
    CatalogNotFound(PathBuf),

    /// Remote price endpoint returned non-200 or the payload is not
    /// readable as a quotes CSV.
    #[error("price fetch failed: {0}")]
    PriceFetch(String),

    /// The optimizer received a matrix that is neither normalized to a
    /// base of 1 nor re-normalizable (a zero first row signals returns
    /// data was passed where prices were expected).
    #[error("misconfigured price data: {0}")]
    MisconfiguredPriceData(String),

    /// The constrained solve errored or returned no parameters. The
    /// solver's own diagnostic message is attached verbatim.
    #[error("solver diverged: {0}")]
    SolverDivergence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}
