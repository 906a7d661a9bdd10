//! Tor circuit renewal over the control port.
//!
//! Speaks the line-oriented control protocol: `AUTHENTICATE "<secret>"`, then
//! `SIGNAL NEWNYM`, then confirms the change out-of-band by fetching the
//! public IP through the local SOCKS port. A renewal only counts when the new
//! IP has not been seen earlier in this process run.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::identity::ProbeClient;

/// States of one renewal handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Idle,
    Authenticating,
    RenewRequested,
    Confirming,
    Established,
    Failed,
}

/// Control endpoint and renewal tuning.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Control protocol endpoint, e.g. `127.0.0.1:9011`.
    pub control_addr: String,
    /// Local SOCKS port circuits egress through.
    pub socks_port: u16,
    /// Pre-shared control-port secret.
    pub auth_secret: String,
    /// Wait for the remote side to build the new circuit before confirming.
    pub settle_delay: Duration,
    /// Maximum NEWNYM retries per renewal request.
    pub max_attempts: u32,
    /// Wait between retries within one renewal request.
    pub retry_wait: Duration,
    /// Deadline for each control-socket read/write and connect.
    pub control_timeout: Duration,
    /// IP-echo endpoint used to confirm the change.
    pub probe_endpoint: String,
    pub probe_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            control_addr: "127.0.0.1:9011".into(),
            socks_port: 9051,
            auth_secret: String::new(),
            settle_delay: Duration::from_secs(5),
            max_attempts: 10,
            retry_wait: Duration::from_secs(5),
            control_timeout: Duration::from_secs(10),
            probe_endpoint: "https://api.ipify.org".into(),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("control connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control operation timed out")]
    Timeout,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("no fresh circuit after {0} attempts")]
    Exhausted(u32),
}

/// Drives circuit renewal and enforces per-process IP diversity.
pub struct CircuitController {
    config: CircuitConfig,
    probe: Arc<dyn ProbeClient>,
    state: CircuitState,
    seen: HashSet<IpAddr>,
}

impl CircuitController {
    pub fn new(config: CircuitConfig, probe: Arc<dyn ProbeClient>) -> Self {
        Self {
            config,
            probe,
            state: CircuitState::Idle,
            seen: HashSet::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Local SOCKS port sessions should egress through.
    pub fn socks_port(&self) -> u16 {
        self.config.socks_port
    }

    /// Public IPs already used in this process run.
    pub fn seen_identities(&self) -> &HashSet<IpAddr> {
        &self.seen
    }

    /// Request a new circuit and confirm it presents a never-seen public IP.
    ///
    /// Opens a fresh control connection, authenticates once, then retries the
    /// renewal signal up to the configured bound when the confirmed IP is
    /// missing or repeats a prior one. Authentication rejection and
    /// connection-level errors fail the attempt outright. The control socket
    /// is closed on both success and failure paths.
    pub async fn renew(&mut self) -> Result<IpAddr, CircuitError> {
        let result = self.renew_inner().await;
        match &result {
            Ok(ip) => {
                self.state = CircuitState::Established;
                log::info!("circuit established with egress {ip} ({} unique)", self.seen.len());
            }
            Err(err) => {
                self.state = CircuitState::Failed;
                log::warn!("circuit renewal failed: {err}");
            }
        }
        result
    }

    async fn renew_inner(&mut self) -> Result<IpAddr, CircuitError> {
        self.state = CircuitState::Authenticating;
        let stream = timeout(
            self.config.control_timeout,
            TcpStream::connect(&self.config.control_addr),
        )
        .await
        .map_err(|_| CircuitError::Timeout)??;
        let mut control = BufStream::new(stream);

        let reply = self
            .exchange(
                &mut control,
                &format!("AUTHENTICATE \"{}\"\r\n", self.config.auth_secret),
            )
            .await?;
        if !reply.contains("250 OK") {
            return Err(CircuitError::AuthRejected(reply.trim().to_string()));
        }

        let socks_proxy = format!("socks5h://127.0.0.1:{}", self.config.socks_port);
        for attempt in 1..=self.config.max_attempts {
            self.state = CircuitState::RenewRequested;
            // Any reply counts as request-accepted; the actual change is
            // confirmed out-of-band below.
            self.exchange(&mut control, "SIGNAL NEWNYM\r\n").await?;
            sleep(self.config.settle_delay).await;

            self.state = CircuitState::Confirming;
            match self
                .probe
                .fetch_ip(
                    Some(&socks_proxy),
                    &self.config.probe_endpoint,
                    self.config.probe_timeout,
                )
                .await
            {
                Ok(ip) if !self.seen.contains(&ip) => {
                    self.seen.insert(ip);
                    return Ok(ip);
                }
                Ok(ip) => {
                    log::debug!("circuit repeated a prior egress {ip} (attempt {attempt})");
                }
                Err(err) => {
                    log::debug!("circuit confirmation probe failed: {err} (attempt {attempt})");
                }
            }
            sleep(self.config.retry_wait).await;
        }

        Err(CircuitError::Exhausted(self.config.max_attempts))
    }

    async fn exchange(
        &self,
        control: &mut BufStream<TcpStream>,
        command: &str,
    ) -> Result<String, CircuitError> {
        timeout(self.config.control_timeout, async {
            control.write_all(command.as_bytes()).await?;
            control.flush().await?;
            let mut line = String::new();
            control.read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        })
        .await
        .map_err(|_| CircuitError::Timeout)?
        .map_err(CircuitError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ProbeError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    struct ScriptedProbe {
        ips: Mutex<Vec<Result<IpAddr, ProbeError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(ips: Vec<Result<IpAddr, ProbeError>>) -> Arc<Self> {
            Arc::new(Self {
                ips: Mutex::new(ips),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ProbeClient for ScriptedProbe {
        async fn fetch_ip(
            &self,
            _proxy: Option<&str>,
            _endpoint: &str,
            _timeout: Duration,
        ) -> Result<IpAddr, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut ips = self.ips.lock().await;
            if ips.is_empty() {
                Err(ProbeError::Transient("script exhausted".into()))
            } else {
                ips.remove(0)
            }
        }
    }

    /// Minimal control-port stub. Accepts one connection, answers
    /// AUTHENTICATE with `auth_reply`, answers any SIGNAL with `250 OK`, and
    /// reports whether a SIGNAL was ever received.
    async fn spawn_control_stub(
        auth_reply: &'static str,
    ) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let signals = Arc::new(AtomicUsize::new(0));
        let signals_out = signals.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                if request.starts_with("AUTHENTICATE") {
                    if socket.write_all(auth_reply.as_bytes()).await.is_err() {
                        break;
                    }
                } else if request.starts_with("SIGNAL NEWNYM") {
                    signals.fetch_add(1, Ordering::SeqCst);
                    if socket.write_all(b"250 OK\r\n").await.is_err() {
                        break;
                    }
                }
            }
        });
        (addr, signals_out)
    }

    fn config(control_addr: String, max_attempts: u32) -> CircuitConfig {
        CircuitConfig {
            control_addr,
            auth_secret: "bot".into(),
            settle_delay: Duration::from_millis(1),
            retry_wait: Duration::from_millis(1),
            max_attempts,
            ..CircuitConfig::default()
        }
    }

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[tokio::test]
    async fn renewal_establishes_on_fresh_ip() {
        let (addr, signals) = spawn_control_stub("250 OK\r\n").await;
        let probe = ScriptedProbe::new(vec![Ok(ip("1.2.3.4"))]);
        let mut controller = CircuitController::new(config(addr, 3), probe);

        let renewed = controller.renew().await.unwrap();
        assert_eq!(renewed, ip("1.2.3.4"));
        assert_eq!(controller.state(), CircuitState::Established);
        assert!(controller.seen_identities().contains(&renewed));
        assert_eq!(signals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_rejection_fails_without_sending_renewal_signal() {
        let (addr, signals) = spawn_control_stub("515 Bad authentication\r\n").await;
        let probe = ScriptedProbe::new(vec![Ok(ip("1.2.3.4"))]);
        let mut controller = CircuitController::new(config(addr, 3), probe.clone());

        let err = controller.renew().await.unwrap_err();
        assert!(matches!(err, CircuitError::AuthRejected(_)));
        assert_eq!(controller.state(), CircuitState::Failed);
        assert_eq!(signals.load(Ordering::SeqCst), 0);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repeated_ip_is_retried_until_a_novel_one_appears() {
        let (addr, signals) = spawn_control_stub("250 OK\r\n").await;
        let probe = ScriptedProbe::new(vec![Ok(ip("1.2.3.4")), Ok(ip("1.2.3.4")), Ok(ip("5.6.7.8"))]);
        let mut controller = CircuitController::new(config(addr.clone(), 5), probe);
        assert_eq!(controller.renew().await.unwrap(), ip("1.2.3.4"));

        // Second renewal sees the old IP once before getting a fresh one.
        let (addr2, _) = spawn_control_stub("250 OK\r\n").await;
        controller.config.control_addr = addr2;
        assert_eq!(controller.renew().await.unwrap(), ip("5.6.7.8"));
        assert!(signals.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failed_not_a_stale_ip() {
        let (addr, signals) = spawn_control_stub("250 OK\r\n").await;
        // Every confirmation returns the same already-seen IP.
        let probe = ScriptedProbe::new(vec![
            Ok(ip("9.9.9.9")),
            Ok(ip("9.9.9.9")),
            Ok(ip("9.9.9.9")),
        ]);
        let mut controller = CircuitController::new(config(addr.clone(), 2), probe);
        controller.seen.insert(ip("9.9.9.9"));

        let err = controller.renew().await.unwrap_err();
        assert!(matches!(err, CircuitError::Exhausted(2)));
        assert_eq!(controller.state(), CircuitState::Failed);
        assert_eq!(signals.load(Ordering::SeqCst), 2);
    }
}
