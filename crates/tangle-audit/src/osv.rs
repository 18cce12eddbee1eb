//! Vulnerability lookup against the OSV database.

use crate::{AuditError, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tangle_cache::PackageCache;
use tangle_core::{Package, Progress, Vulnerability};
use tracing::warn;

const OSV_BASE_URL: &str = "https://api.osv.dev";

#[derive(Debug, Deserialize)]
struct OsvResponse {
    #[serde(default)]
    vulns: Vec<OsvVulnerability>,
}

#[derive(Debug, Deserialize)]
struct OsvVulnerability {
    id: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

impl From<OsvVulnerability> for Vulnerability {
    fn from(osv: OsvVulnerability) -> Self {
        // prefer the summary, fall back to details, then to a placeholder
        let summary = osv
            .summary
            .filter(|s| !s.is_empty())
            .or(osv.details.filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "N/A".to_string());
        Self::new(osv.id, osv.aliases, summary)
    }
}

/// Client for the OSV `v1/query` endpoint.
#[derive(Debug, Clone)]
pub struct OsvClient {
    client: reqwest::Client,
    base_url: String,
}

impl Default for OsvClient {
    fn default() -> Self {
        Self::new(OSV_BASE_URL)
    }
}

impl OsvClient {
    /// Create a client against the given base URL (tests point this at a
    /// mock server).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Query the known vulnerabilities of one package version.
    pub async fn query(&self, package: &Package) -> Result<Vec<Vulnerability>> {
        let query = json!({
            "version": package.version.to_string(),
            "package": { "name": package.name },
        });
        let response = self
            .client
            .post(format!("{}/v1/query", self.base_url))
            .json(&query)
            .send()
            .await
            .map_err(|e| AuditError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuditError::Network(format!(
                "OSV returned {}",
                response.status()
            )));
        }
        let parsed: OsvResponse = response
            .json()
            .await
            .map_err(|e| AuditError::Parse(e.to_string()))?;
        Ok(parsed.vulns.into_iter().map(Vulnerability::from).collect())
    }
}

/// Enrich every package in `repo` with vulnerability information.
///
/// Lookups run concurrently up to `max_workers`; a failed lookup is logged
/// and the package keeps its current vulnerability set.
pub async fn audit(
    repo: &dyn PackageCache,
    client: &OsvClient,
    max_workers: usize,
    progress: Arc<dyn Progress>,
) {
    let packages = repo.packages();
    progress.add_total(packages.len() as u64);

    let mut pending = packages.into_iter();
    let mut in_flight = FuturesUnordered::new();
    let concurrency = max_workers.max(1);

    loop {
        while in_flight.len() < concurrency {
            let Some(package) = pending.next() else {
                break;
            };
            let client = client.clone();
            in_flight.push(async move {
                let result = client.query(&package).await;
                (package, result)
            });
        }
        let Some((package, result)) = in_flight.next().await else {
            break;
        };
        progress.inc(1);
        match result {
            Ok(vulns) => {
                let enriched = package.update_vulnerabilities(vulns);
                if let Err(error) = repo.add(&enriched) {
                    warn!(package = %enriched, %error, "failed to record vulnerabilities");
                }
            }
            Err(error) => {
                warn!(package = %package, %error, "vulnerability lookup failed");
            }
        }
    }
    progress.finish();
}
