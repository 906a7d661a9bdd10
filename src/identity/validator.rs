//! Protocol classification and liveness probing.
//!
//! Each candidate is tunnelled through in a fixed protocol trial order and
//! asked to fetch the public IP from several independent echo services.
//! Classification is first-match: a candidate that answers to both HTTP and
//! SOCKS5 is recorded as HTTP only.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;

use super::{IdentityRecord, ProtocolKind};

/// Independent "what is my IP" services queried during probes.
pub const PROBE_ENDPOINTS: [&str; 4] = [
    "https://api.myip.com",
    "https://ifconfig.me/ip",
    "https://ipinfo.io/json",
    "https://api.ipify.org?format=json",
];

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Failure modes of a single probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The proxy rejected our credentials or refused the tunnel (403/407).
    /// Terminal for the protocol kind being trialled.
    #[error("probe denied with status {0}")]
    Denied(u16),
    /// The probe did not complete within its deadline.
    #[error("probe timed out")]
    Timeout,
    /// Connection-level or unexpected-status failure; the next endpoint may
    /// still succeed.
    #[error("transient probe failure: {0}")]
    Transient(String),
    /// The endpoint answered 2xx but the body held no recognisable IP.
    #[error("probe body was not a recognisable IP")]
    Unparseable,
}

/// Transport seam for IP-echo probes.
///
/// Kept behind a trait so validation logic can be exercised against scripted
/// responses without live proxies.
#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// GET `endpoint` (optionally through `proxy`) and extract the public IP.
    async fn fetch_ip(
        &self,
        proxy: Option<&str>,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<IpAddr, ProbeError>;
}

/// Extract an IP from either a bare-text or JSON (`ip` field) echo body.
pub fn parse_ip_body(body: &str) -> Option<IpAddr> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
            && let Some(ip) = value.get("ip").and_then(|v| v.as_str())
        {
            return IpAddr::from_str(ip.trim()).ok();
        }
    }
    IpAddr::from_str(trimmed).ok()
}

/// Classification churns through many short-lived proxy URLs, so the client
/// cache is capped; hitting the cap drops the whole map.
const CLIENT_CACHE_CAP: usize = 32;

/// Reqwest-backed probe transport with one client per proxy endpoint.
pub struct ReqwestProbeClient {
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestProbeClient {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, proxy: Option<&str>) -> Result<reqwest::Client, ProbeError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().user_agent(BROWSER_USER_AGENT);
        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| ProbeError::Transient(err.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| ProbeError::Transient(err.to_string()))?;
        if guard.len() >= CLIENT_CACHE_CAP {
            guard.clear();
        }
        guard.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProbeClient for ReqwestProbeClient {
    async fn fetch_ip(
        &self,
        proxy: Option<&str>,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<IpAddr, ProbeError> {
        let client = self.client(proxy).await?;
        let response = client
            .get(endpoint)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Transient(err.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(ProbeError::Denied(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ProbeError::Transient(format!("status {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|err| ProbeError::Transient(err.to_string()))?;
        parse_ip_body(&body).ok_or(ProbeError::Unparseable)
    }
}

/// Probe timeouts and endpoint list.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub endpoints: Vec<String>,
    /// Per-probe deadline while classifying an untested candidate.
    pub classify_timeout: Duration,
    /// Longer per-probe deadline for confirming an already-verified record.
    pub confirm_timeout: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            endpoints: PROBE_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            classify_timeout: Duration::from_secs(10),
            confirm_timeout: Duration::from_secs(15),
        }
    }
}

/// Classifies candidates and confirms liveness of verified records.
pub struct IdentityValidator<P: ProbeClient + ?Sized> {
    probe: std::sync::Arc<P>,
    config: ValidatorConfig,
}

impl<P: ProbeClient + ?Sized> IdentityValidator<P> {
    pub fn new(probe: std::sync::Arc<P>, config: ValidatorConfig) -> Self {
        Self { probe, config }
    }

    /// Determine which protocol kind the candidate speaks, if any.
    ///
    /// Walks the fixed trial order; within a kind, endpoints are tried until
    /// one passes or a denial ends the kind. A candidate that passes nothing
    /// is discarded for this cycle, not quarantined.
    pub async fn classify(&self, candidate: &IdentityRecord) -> Option<ProtocolKind> {
        for kind in ProtocolKind::CLASSIFY_ORDER {
            let proxy = candidate.proxy_url_for(kind);
            for endpoint in &self.config.endpoints {
                match self
                    .probe
                    .fetch_ip(Some(&proxy), endpoint, self.config.classify_timeout)
                    .await
                {
                    Ok(ip) => {
                        log::info!("{} classified as {kind} (egress {ip})", candidate.endpoint());
                        return Some(kind);
                    }
                    Err(ProbeError::Denied(status)) => {
                        // Terminal for this kind only; move on to the next.
                        log::debug!(
                            "{} denied as {kind} (status {status})",
                            candidate.endpoint()
                        );
                        break;
                    }
                    Err(err) => {
                        log::trace!("{} probe via {endpoint} failed: {err}", candidate.endpoint());
                    }
                }
            }
        }
        log::debug!("{} failed classification", candidate.endpoint());
        None
    }

    /// Re-probe a verified record under its recorded protocol kind only.
    ///
    /// Used immediately before handing the record to a consumer; never
    /// reclassifies.
    pub async fn confirm_live(&self, record: &IdentityRecord) -> Option<IpAddr> {
        let proxy = record.proxy_url()?;
        for endpoint in &self.config.endpoints {
            match self
                .probe
                .fetch_ip(Some(&proxy), endpoint, self.config.confirm_timeout)
                .await
            {
                Ok(ip) => {
                    log::debug!("{} live (egress {ip})", record.endpoint());
                    return Some(ip);
                }
                Err(err) => {
                    log::trace!("{} liveness probe via {endpoint} failed: {err}", record.endpoint());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Credentials;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted probe transport: each queued step is consumed in order.
    pub(crate) struct ScriptedProbe {
        steps: Mutex<Vec<Result<IpAddr, ProbeError>>>,
        pub calls: AtomicUsize,
        pub seen_proxies: Mutex<Vec<String>>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(steps: Vec<Result<IpAddr, ProbeError>>) -> Self {
            Self {
                steps: Mutex::new(steps),
                calls: AtomicUsize::new(0),
                seen_proxies: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProbeClient for ScriptedProbe {
        async fn fetch_ip(
            &self,
            proxy: Option<&str>,
            _endpoint: &str,
            _timeout: Duration,
        ) -> Result<IpAddr, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(p) = proxy {
                self.seen_proxies.lock().await.push(p.to_string());
            }
            let mut steps = self.steps.lock().await;
            if steps.is_empty() {
                Err(ProbeError::Transient("script exhausted".into()))
            } else {
                steps.remove(0)
            }
        }
    }

    fn candidate() -> IdentityRecord {
        IdentityRecord::candidate(
            "10.1.1.1",
            3128,
            Some(Credentials {
                username: "u".into(),
                password: "p".into(),
            }),
        )
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn validator(probe: Arc<ScriptedProbe>) -> IdentityValidator<ScriptedProbe> {
        IdentityValidator::new(probe, ValidatorConfig::default())
    }

    #[test]
    fn parses_bare_and_json_bodies() {
        assert_eq!(parse_ip_body("  93.184.216.34\n"), Some(ip("93.184.216.34")));
        assert_eq!(
            parse_ip_body(r#"{"ip":"93.184.216.34","country":"US"}"#),
            Some(ip("93.184.216.34"))
        );
        assert_eq!(parse_ip_body("2606:4700::1111"), Some(ip("2606:4700::1111")));
        assert_eq!(parse_ip_body("<html>blocked</html>"), None);
        assert_eq!(parse_ip_body(r#"{"country":"US"}"#), None);
    }

    #[tokio::test]
    async fn classifies_http_after_timeout_on_first_endpoint() {
        // Timeout on the first echo endpoint, pass on the second: the
        // candidate must come back as HTTP without any SOCKS probes.
        let probe = Arc::new(ScriptedProbe::new(vec![
            Err(ProbeError::Timeout),
            Ok(ip("1.2.3.4")),
        ]));
        let validator = validator(probe.clone());
        let kind = validator.classify(&candidate()).await;
        assert_eq!(kind, Some(ProtocolKind::Http));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        let proxies = probe.seen_proxies.lock().await;
        assert!(proxies.iter().all(|p| p.starts_with("http://")));
    }

    #[tokio::test]
    async fn denial_skips_to_next_protocol_kind() {
        // HTTP denied on first probe, HTTPS passes immediately.
        let probe = Arc::new(ScriptedProbe::new(vec![
            Err(ProbeError::Denied(407)),
            Ok(ip("1.2.3.4")),
        ]));
        let validator = validator(probe.clone());
        let kind = validator.classify(&candidate()).await;
        assert_eq!(kind, Some(ProtocolKind::Https));
        // One denied HTTP probe, one passing HTTPS probe: the denial must not
        // consume the remaining HTTP endpoints.
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausting_all_combinations_yields_none() {
        let probe = Arc::new(ScriptedProbe::new(Vec::new()));
        let validator = validator(probe.clone());
        assert_eq!(validator.classify(&candidate()).await, None);
        // Four kinds times four endpoints, no early exits.
        assert_eq!(probe.calls.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn confirm_live_uses_recorded_kind_only() {
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(ip("9.9.9.9"))]));
        let validator = validator(probe.clone());
        let record = candidate().into_verified(ProtocolKind::Socks5);
        let live = validator.confirm_live(&record).await;
        assert_eq!(live, Some(ip("9.9.9.9")));
        let proxies = probe.seen_proxies.lock().await;
        assert_eq!(proxies.len(), 1);
        assert!(proxies[0].starts_with("socks5://"));
    }

    #[tokio::test]
    async fn client_cache_stays_bounded() {
        // A long-running worker classifies an open-ended stream of candidates;
        // the per-proxy client map must not grow with them.
        let probe = ReqwestProbeClient::new();
        for i in 0..100u32 {
            let proxy = format!("http://10.0.0.{i}:8080");
            probe.client(Some(&proxy)).await.unwrap();
        }
        assert!(probe.clients.lock().await.len() <= CLIENT_CACHE_CAP);
    }

    #[tokio::test]
    async fn confirm_live_fails_for_unclassified_record() {
        let probe = Arc::new(ScriptedProbe::new(vec![Ok(ip("9.9.9.9"))]));
        let validator = validator(probe.clone());
        assert_eq!(validator.confirm_live(&candidate()).await, None);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }
}
