//! Finam-style remote collaborator: the market catalog embedded in an HTML
//! page and the CSV quote-history export endpoint.
//!
//! The catalog is not served as an API; it lives as near-JSON arrays inside
//! the page's JavaScript. All of that textual fragility (marker search, JSON
//! repair, list splitting) is deliberately isolated in this module so that
//! upstream markup changes fail loudly in one place.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use crate::catalog::{CatalogProvider, SecurityRecord};
use crate::config::{ListMarker, ProviderConfig};
use crate::error::PortoptError;
use crate::quotes::HistoryProvider;

#[derive(Debug, Deserialize)]
struct MarketEntry {
    value: i64,
    title: String,
}

pub struct FinamProvider {
    config: ProviderConfig,
}

impl FinamProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn client(&self) -> Result<reqwest::Client, PortoptError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PortoptError::CatalogFetch(format!("bad header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PortoptError::CatalogFetch(format!("bad header value: {e}")))?;
            headers.insert(name, value);
        }
        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| PortoptError::CatalogFetch(e.to_string()))
    }

    async fn get_text(&self, url: &str) -> Result<String, PortoptError> {
        debug!("Requesting {}", url);
        let response = self
            .client()?
            .get(url)
            .send()
            .await
            .map_err(|e| PortoptError::CatalogFetch(format!("request error for {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortoptError::CatalogFetch(format!(
                "response error - {status} for {url}"
            )));
        }
        response
            .text()
            .await
            .map_err(|e| PortoptError::CatalogFetch(format!("body read error for {url}: {e}")))
    }

    async fn fetch_market_entries(&self) -> Result<Vec<MarketEntry>, PortoptError> {
        let page = self.get_text(&self.config.market_info_url).await?;
        let fragment = find_substring(
            &page,
            &self.config.markets_marker.start,
            &self.config.markets_marker.stop,
        )
        .ok_or_else(|| {
            PortoptError::CatalogFetch(format!(
                "market markers not found in {}",
                self.config.market_info_url
            ))
        })?;

        let repaired = format!("[{}]", repair_json(fragment));
        debug!("Repaired market fragment: {}", repaired);
        serde_json::from_str(&repaired).map_err(|e| {
            PortoptError::CatalogFetch(format!("market fragment is not repairable JSON: {e}"))
        })
    }

    /// Market id to display name, extracted from the provider page.
    ///
    /// The page carries `{value: 1, title: 'MICEX'}, ...` between the two
    /// configured markers; the fragment is repaired into strict JSON before
    /// parsing.
    pub async fn markets_by_id(&self) -> Result<HashMap<i64, String>, PortoptError> {
        let entries = self.fetch_market_entries().await?;
        Ok(entries.into_iter().map(|m| (m.value, m.title)).collect())
    }

    /// The reverse orientation: market display name to id.
    pub async fn markets_by_name(&self) -> Result<HashMap<String, i64>, PortoptError> {
        let entries = self.fetch_market_entries().await?;
        Ok(entries.into_iter().map(|m| (m.title, m.value)).collect())
    }

    fn extract_list<'a>(
        &self,
        page: &'a str,
        marker: &ListMarker,
        what: &str,
    ) -> Result<Vec<&'a str>, PortoptError> {
        let fragment = find_substring(page, &marker.start, &marker.stop).ok_or_else(|| {
            PortoptError::CatalogFetch(format!("{what} markers not found in issuer cache page"))
        })?;
        Ok(fragment
            .split(marker.split.as_str())
            .map(|item| item.trim().trim_matches('\''))
            .collect())
    }
}

#[async_trait]
impl CatalogProvider for FinamProvider {
    /// Builds the full security catalog by zipping the four issuer lists
    /// embedded in the cache page with the market name mapping.
    async fn fetch_catalog(&self) -> Result<Vec<SecurityRecord>, PortoptError> {
        let markets = self.markets_by_id().await?;
        let page = self.get_text(&self.config.emitent_cache_url).await?;

        let markers = &self.config.emitent_markers;
        let ids = self.extract_list(&page, &markers.emitent_ids, "emitent_ids")?;
        let names = self.extract_list(&page, &markers.emitent_names, "emitent_names")?;
        let codes = self.extract_list(&page, &markers.emitent_codes, "emitent_codes")?;
        let market_ids = self.extract_list(&page, &markers.emitent_markets, "emitent_markets")?;

        if ids.len() != names.len() || ids.len() != codes.len() || ids.len() != market_ids.len() {
            return Err(PortoptError::CatalogFetch(format!(
                "issuer lists have mismatched lengths: ids={}, names={}, codes={}, markets={}",
                ids.len(),
                names.len(),
                codes.len(),
                market_ids.len()
            )));
        }

        let mut records = Vec::with_capacity(ids.len());
        for i in 0..ids.len() {
            let emitent_id: i64 = ids[i].parse().map_err(|_| {
                PortoptError::CatalogFetch(format!("emitent id '{}' is not numeric", ids[i]))
            })?;
            let market_id: i64 = market_ids[i].parse().map_err(|_| {
                PortoptError::CatalogFetch(format!("market id '{}' is not numeric", market_ids[i]))
            })?;
            let market_name = markets.get(&market_id).cloned().ok_or_else(|| {
                PortoptError::CatalogFetch(format!("market id {market_id} has no title"))
            })?;
            records.push(SecurityRecord {
                market_id,
                market_name,
                emitent_id,
                emitent_code: codes[i].to_string(),
                emitent_name: names[i].to_string(),
            });
        }
        debug!("Catalog fetch produced {} records", records.len());
        Ok(records)
    }
}

#[async_trait]
impl HistoryProvider for FinamProvider {
    async fn fetch_history(
        &self,
        security: &SecurityRecord,
        to_date: NaiveDate,
    ) -> Result<String, PortoptError> {
        let url = self.history_url(security, to_date)?;
        debug!("History URL {}", url);
        let response = self
            .client()
            .map_err(|e| PortoptError::PriceFetch(e.to_string()))?
            .get(&url)
            .send()
            .await
            .map_err(|e| PortoptError::PriceFetch(format!("request error for {url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortoptError::PriceFetch(format!(
                "response error - {status} for {}",
                security.emitent_code
            )));
        }
        response
            .text()
            .await
            .map_err(|e| PortoptError::PriceFetch(format!("body read error: {e}")))
    }
}

impl FinamProvider {
    /// The export URL for one security's full history up to `to_date`.
    ///
    /// The provider counts months from zero and expects both a `dt/mt/yt`
    /// triple and a pre-formatted `to` date. History always starts at the
    /// fixed 1990-01-01 epoch; the cache layer trims to the requested range.
    pub fn history_url(
        &self,
        security: &SecurityRecord,
        to_date: NaiveDate,
    ) -> Result<String, PortoptError> {
        let request = &self.config.request;
        let (tf_index, _) = request
            .timeframe()
            .map_err(|e| PortoptError::PriceFetch(e.to_string()))?;

        let url = format!(
            "{base}?market={market}&em={em}&code={code}&apply=0&df=1&mf=0&yf=1990&\
             from=01.01.1990&dt={dt}&mt={mt}&yt={yt}&to={to}&p={p}&f=payload&e=.csv&\
             cn={cn}&dtf={dtf}&tmf={tmf}&MSOR=0&mstime=on&mstimever=1&sep={sep}&\
             sep2={sep2}&datf={datf}&at=1",
            base = self.config.history_url,
            market = security.market_id,
            em = security.emitent_id,
            code = security.emitent_code,
            dt = to_date.day(),
            mt = to_date.month0(),
            yt = to_date.year(),
            to = to_date.format("%d-%m-%Y"),
            p = tf_index,
            cn = security.emitent_code,
            dtf = request.date_format,
            tmf = request.time_format,
            sep = request.sep_fields,
            sep2 = request.sep_digits,
            datf = request.header,
        );
        Ok(url)
    }
}

/// The text between `start` and the first following `stop`, or None when
/// either marker is absent.
fn find_substring<'a>(text: &'a str, start: &str, stop: &str) -> Option<&'a str> {
    let begin = text.find(start)? + start.len();
    let end = text[begin..].find(stop)?;
    Some(&text[begin..begin + end])
}

/// Repairs the page's near-JSON into strict JSON: bare `value:`/`title:`
/// keys become quoted and single quotes become double quotes.
fn repair_json(text: &str) -> String {
    text.replace("value:", "\"value\":")
        .replace("title:", "\"title\":")
        .replace('\'', "\"")
}
