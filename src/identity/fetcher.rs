//! Candidate retrieval from the remote identity list.
//!
//! The list endpoint serves newline-delimited `address:port:username:password`
//! records as a flat snapshot. Malformed lines are tolerated, and any network
//! failure degrades to an empty batch rather than an error: the rotation
//! policy treats an empty fetch as "no new candidates this cycle".

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::IntoUrl;
use url::Url;

use super::{Credentials, IdentityRecord};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

static HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]*$").unwrap());

/// Source of raw identity candidates.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Retrieve the current candidate snapshot. Empty on any failure.
    async fn fetch(&self) -> Vec<IdentityRecord>;
}

/// Parse the line-oriented list format.
///
/// Lines that do not split into exactly four colon-delimited fields, whose
/// host is not a plausible hostname or address, or whose port is not a valid
/// number are skipped silently.
pub fn parse_candidates(raw: &str) -> Vec<IdentityRecord> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let parts: Vec<&str> = line.split(':').collect();
            if parts.len() != 4 || !HOST_RE.is_match(parts[0]) {
                return None;
            }
            let port: u16 = parts[1].parse().ok()?;
            Some(IdentityRecord::candidate(
                parts[0],
                port,
                Some(Credentials {
                    username: parts[2].to_string(),
                    password: parts[3].to_string(),
                }),
            ))
        })
        .collect()
}

/// Fetches candidates from a fixed HTTP list location.
pub struct HttpCandidateSource {
    url: Url,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpCandidateSource {
    pub fn new(url: impl IntoUrl) -> reqwest::Result<Self> {
        Ok(Self {
            url: url.into_url()?,
            timeout: DEFAULT_FETCH_TIMEOUT,
            client: reqwest::Client::builder().build()?,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch_text(&self) -> reqwest::Result<String> {
        self.client
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl CandidateSource for HttpCandidateSource {
    async fn fetch(&self) -> Vec<IdentityRecord> {
        match self.fetch_text().await {
            Ok(body) => {
                let candidates = parse_candidates(&body);
                log::info!("fetched {} candidates from list source", candidates.len());
                candidates
            }
            Err(err) => {
                log::warn!("candidate fetch failed: {err}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_lines() {
        let raw = "1.2.3.4:8080:alice:secret\n5.6.7.8:1080:bob:hunter2\n";
        let candidates = parse_candidates(raw);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].address, "1.2.3.4");
        assert_eq!(candidates[0].port, 8080);
        assert_eq!(
            candidates[1].credentials.as_ref().unwrap().username,
            "bob"
        );
        assert!(candidates[0].protocol.is_none());
    }

    #[test]
    fn skips_malformed_lines() {
        // Three well-formed records plus one with only three fields.
        let raw = "1.1.1.1:80:u:p\n2.2.2.2:81:u\n3.3.3.3:82:u:p\n4.4.4.4:83:u:p";
        let candidates = parse_candidates(raw);
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.address != "2.2.2.2"));
    }

    #[test]
    fn skips_unparseable_ports_and_blank_lines() {
        let raw = "\n1.1.1.1:eighty:u:p\n\n2.2.2.2:8080:u:p\n";
        let candidates = parse_candidates(raw);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address, "2.2.2.2");
    }

    #[test]
    fn skips_implausible_hosts() {
        let raw = "proxy.example.com:8080:u:p\nnot a host:8080:u:p\n:8080:u:p\n";
        let candidates = parse_candidates(raw);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address, "proxy.example.com");
    }
}
