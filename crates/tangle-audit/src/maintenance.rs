//! Maintenance-status checks against the GitHub API.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tangle_cache::PackageCache;
use tangle_core::{MaintenanceInfo, Package, Progress};
use tangle_resolvers::resolver_by_name;
use tracing::{debug, warn};

const GITHUB_API_BASE: &str = "https://api.github.com";

/// A repository older than this many days without a push counts as stale.
const STALE_THRESHOLD_DAYS: i64 = 365;

static GITHUB_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com[:/](?P<owner>[^/]+)/(?P<repo>[^/\s]+?)(?:\.git)?/?$")
        .unwrap_or_else(|_| unreachable!())
});

/// Extract `(owner, repo)` from a GitHub URL in https or ssh form, with or
/// without a `.git` suffix.
#[must_use]
pub fn extract_github_repo(url: &str) -> Option<(String, String)> {
    let captured = GITHUB_URL.captures(url)?;
    Some((captured["owner"].to_string(), captured["repo"].to_string()))
}

/// Client for repository metadata lookups.
#[derive(Debug, Clone)]
pub struct MaintenanceChecker {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl Default for MaintenanceChecker {
    fn default() -> Self {
        Self::new(GITHUB_API_BASE, None)
    }
}

impl MaintenanceChecker {
    /// Create a checker against the given API base URL, optionally
    /// authenticated (unauthenticated GitHub requests rate-limit quickly).
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    async fn fetch_repo_metadata(&self, owner: &str, repo: &str) -> Option<serde_json::Value> {
        let mut request = self
            .client
            .get(format!("{}/repos/{owner}/{repo}", self.base_url))
            .header(reqwest::header::USER_AGENT, "tangle")
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json");
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }
        let response = request.send().await.ok()?;

        if let Some(remaining) = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            && remaining < 10
        {
            warn!(remaining, "GitHub API rate limit low");
        }
        if response.status() == reqwest::StatusCode::FORBIDDEN {
            warn!("GitHub API rate limit exceeded");
            return None;
        }
        if !response.status().is_success() {
            debug!(owner, repo, status = %response.status(), "repository lookup failed");
            return None;
        }
        response.json().await.ok()
    }

    /// `pushed_at` reflects actual commits; fall back to `created_at` for
    /// repositories that were never pushed to.
    fn extract_maintenance_date(metadata: &serde_json::Value) -> Option<DateTime<Utc>> {
        for key in ["pushed_at", "created_at"] {
            if let Some(date) = metadata[key].as_str()
                && let Ok(parsed) = DateTime::parse_from_rfc3339(date)
            {
                return Some(parsed.with_timezone(&Utc));
            }
        }
        None
    }

    /// Determine the maintenance status of one package.
    pub async fn check_package(&self, package: &Package) -> MaintenanceInfo {
        let repository_url = match resolver_by_name(&package.source) {
            Ok(resolver) => resolver.repository_url(package).await,
            Err(_) => None,
        };
        let Some(repository_url) = repository_url else {
            return MaintenanceInfo {
                error: Some("No repository URL found".to_string()),
                ..MaintenanceInfo::default()
            };
        };
        let Some((owner, repo)) = extract_github_repo(&repository_url) else {
            return MaintenanceInfo {
                repository_url: Some(repository_url),
                error: Some("Repository not hosted on GitHub".to_string()),
                ..MaintenanceInfo::default()
            };
        };
        let Some(metadata) = self.fetch_repo_metadata(&owner, &repo).await else {
            return MaintenanceInfo {
                repository_url: Some(repository_url),
                error: Some("Failed to fetch repository metadata".to_string()),
                ..MaintenanceInfo::default()
            };
        };
        let Some(last_commit) = Self::extract_maintenance_date(&metadata) else {
            return MaintenanceInfo {
                repository_url: Some(repository_url),
                error: Some("No commit date found".to_string()),
                ..MaintenanceInfo::default()
            };
        };
        let days_since = (Utc::now() - last_commit).num_days();
        MaintenanceInfo {
            repository_url: Some(repository_url),
            last_commit_date: Some(last_commit),
            is_stale: Some(days_since > STALE_THRESHOLD_DAYS),
            days_since_update: Some(days_since),
            error: None,
        }
    }
}

/// Enrich every package in `repo` with maintenance information.
pub async fn check_maintenance(
    repo: &dyn PackageCache,
    checker: &MaintenanceChecker,
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
            let checker = checker.clone();
            in_flight.push(async move {
                let info = checker.check_package(&package).await;
                (package, info)
            });
        }
        let Some((mut package, info)) = in_flight.next().await else {
            break;
        };
        progress.inc(1);
        package.maintenance = Some(info);
        if let Err(error) = repo.add(&package) {
            warn!(package = %package, %error, "failed to record maintenance info");
        }
    }
    progress.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("https://github.com/owner/repo", Some(("owner", "repo")) ; "https form")]
    #[test_case("https://github.com/owner/repo.git", Some(("owner", "repo")) ; "https with git suffix")]
    #[test_case("git@github.com:owner/repo.git", Some(("owner", "repo")) ; "ssh form")]
    #[test_case("https://gitlab.com/owner/repo", None ; "not github")]
    fn github_url_extraction(url: &str, expected: Option<(&str, &str)>) {
        assert_eq!(
            extract_github_repo(url),
            expected.map(|(o, r)| (o.to_string(), r.to_string()))
        );
    }

    #[test]
    fn maintenance_date_prefers_pushed_at() {
        let metadata = serde_json::json!({
            "pushed_at": "2024-01-02T03:04:05Z",
            "created_at": "2019-01-01T00:00:00Z",
        });
        let date = MaintenanceChecker::extract_maintenance_date(&metadata).unwrap();
        assert_eq!(date.to_rfc3339(), "2024-01-02T03:04:05+00:00");

        let created_only = serde_json::json!({"created_at": "2019-01-01T00:00:00Z"});
        assert!(MaintenanceChecker::extract_maintenance_date(&created_only).is_some());
        assert!(
            MaintenanceChecker::extract_maintenance_date(&serde_json::json!({})).is_none()
        );
    }
}
