//! Tunnel management
//!
//! Exposes the locally running application to the remote service, either
//! through the Glimpse relay (an ngrok subprocess authorized by a tunnel
//! token) or through a vendor-managed secure tunnel supplied by the browser
//! grid. Only one path is active per run.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use url::Url;

/// Attempts to bring up the relay before giving up. The relay agent may still
/// be initializing, so this budget is longer than the vendor one.
const RELAY_ATTEMPTS: u32 = 12;

/// Attempts to bring up the vendor tunnel before giving up.
const VENDOR_ATTEMPTS: u32 = 3;

/// Backoff between launch attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Local inspection endpoint the relay agent serves its tunnel list on.
const RELAY_INSPECT_URL: &str = "http://127.0.0.1:4040/api/tunnels";

/// Inspection polls within a single relay launch attempt.
const INSPECT_CHECKS: u32 = 3;

/// Longest wait for the vendor subprocess to report ready.
const VENDOR_READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("No Tunnel Token")]
    MissingToken,

    #[error("invalid tunnel target `{0}`")]
    InvalidTarget(String),

    #[error("failed to launch tunnel process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("tunnel did not become ready after {0} attempts")]
    NotReady(u32),
}

/// Which tunnel path to bring up.
#[derive(Debug, Clone)]
pub enum TunnelSpec {
    /// Glimpse relay in front of a local host, authorized by a token fetched
    /// from the API.
    Relay { host: String, token: String },
    /// Vendor-managed secure tunnel into the browser grid.
    Vendor {
        username: String,
        access_key: String,
        tunnel_identifier: Option<String>,
    },
}

/// Connection parameters for the relay agent, derived from the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub addr: String,
    pub host_header: String,
    pub bind_tls: bool,
}

impl RelayOptions {
    /// Derive relay parameters from a target host. Plain hosts are treated as
    /// `http`; an `https` target forwards with header rewriting instead of a
    /// fixed host header.
    pub fn for_target(host: &str) -> Result<RelayOptions, TunnelError> {
        let normalized = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };
        let url =
            Url::parse(&normalized).map_err(|_| TunnelError::InvalidTarget(host.to_string()))?;
        let hostname = url
            .host_str()
            .ok_or_else(|| TunnelError::InvalidTarget(host.to_string()))?;

        if url.scheme() == "https" {
            let addr = match url.port() {
                Some(port) => format!("https://{}:{}", hostname, port),
                None => format!("https://{}", hostname),
            };
            return Ok(RelayOptions {
                addr,
                host_header: "rewrite".to_string(),
                bind_tls: true,
            });
        }

        let port = url.port().unwrap_or(80);
        let host_header = if port == 80 {
            hostname.to_string()
        } else {
            format!("{}:{}", hostname, port)
        };
        Ok(RelayOptions {
            addr: format!("{}:{}", hostname, port),
            host_header,
            bind_tls: true,
        })
    }
}

/// A live tunnel. `host` is the externally reachable host when the path
/// provides one (the relay does, vendor tunnels route internally).
#[derive(Debug)]
pub struct TunnelHandle {
    pub host: Option<String>,
    child: Option<Child>,
}

impl TunnelHandle {
    /// A handle with no subprocess behind it. Used in tests.
    pub fn detached(host: Option<String>) -> TunnelHandle {
        TunnelHandle { host, child: None }
    }

    fn with_child(host: Option<String>, child: Child) -> TunnelHandle {
        TunnelHandle {
            host,
            child: Some(child),
        }
    }
}

/// Launches tunnel subprocesses. Seam for tests, which substitute a launcher
/// that never spawns anything.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch_relay(
        &self,
        options: &RelayOptions,
        token: &str,
    ) -> Result<TunnelHandle, TunnelError>;

    async fn launch_vendor(
        &self,
        username: &str,
        access_key: &str,
        tunnel_identifier: Option<&str>,
    ) -> Result<TunnelHandle, TunnelError>;
}

/// Spawns the real relay (`ngrok`) and vendor (`sc`) subprocesses.
pub struct ProcessLauncher {
    inspect_url: String,
}

impl ProcessLauncher {
    pub fn new() -> ProcessLauncher {
        ProcessLauncher {
            inspect_url: RELAY_INSPECT_URL.to_string(),
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        ProcessLauncher::new()
    }
}

/// Pick the https public URL out of the relay agent's tunnel list, returning
/// its host.
fn public_https_host(tunnels: &Value) -> Option<String> {
    tunnels
        .get("tunnels")?
        .as_array()?
        .iter()
        .filter_map(|t| t.get("public_url")?.as_str())
        .find(|u| u.starts_with("https://"))
        .map(|u| u.trim_start_matches("https://").to_string())
}

#[async_trait]
impl TunnelLauncher for ProcessLauncher {
    async fn launch_relay(
        &self,
        options: &RelayOptions,
        token: &str,
    ) -> Result<TunnelHandle, TunnelError> {
        let mut command = Command::new("ngrok");
        command
            .arg("http")
            .arg(&options.addr)
            .arg(format!("--authtoken={}", token))
            .arg(format!("--host-header={}", options.host_header));
        if options.bind_tls {
            command.arg("--bind-tls=true");
        }
        command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let http = reqwest::Client::new();
        for _ in 0..INSPECT_CHECKS {
            tokio::time::sleep(RETRY_DELAY).await;
            let Ok(response) = http.get(&self.inspect_url).send().await else {
                continue;
            };
            let Ok(body) = response.json::<Value>().await else {
                continue;
            };
            if let Some(host) = public_https_host(&body) {
                return Ok(TunnelHandle::with_child(Some(host), child));
            }
        }
        let _ = child.kill().await;
        Err(TunnelError::NotReady(INSPECT_CHECKS))
    }

    async fn launch_vendor(
        &self,
        username: &str,
        access_key: &str,
        tunnel_identifier: Option<&str>,
    ) -> Result<TunnelHandle, TunnelError> {
        let mut command = Command::new("sc");
        command.arg("-u").arg(username).arg("-k").arg(access_key);
        if let Some(identifier) = tunnel_identifier {
            command.arg("-i").arg(identifier);
        }
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let ready = match child.stdout.take() {
            Some(stdout) => {
                let mut lines = BufReader::new(stdout).lines();
                tokio::time::timeout(VENDOR_READY_TIMEOUT, async {
                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.contains("you may start your tests") {
                            return true;
                        }
                    }
                    false
                })
                .await
                .unwrap_or(false)
            }
            None => false,
        };

        if ready {
            Ok(TunnelHandle::with_child(None, child))
        } else {
            let _ = child.kill().await;
            Err(TunnelError::NotReady(1))
        }
    }
}

pub struct TunnelManager {
    launcher: Box<dyn TunnelLauncher>,
    retry_delay: Duration,
}

impl TunnelManager {
    pub fn new() -> TunnelManager {
        TunnelManager::with_launcher(Box::new(ProcessLauncher::new()))
    }

    pub fn with_launcher(launcher: Box<dyn TunnelLauncher>) -> TunnelManager {
        TunnelManager {
            launcher,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Shrink the launch backoff. Intended for tests.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Bring up the tunnel described by `spec`. The relay path refuses to
    /// launch anything without a token.
    pub async fn connect(&self, spec: &TunnelSpec) -> Result<TunnelHandle, TunnelError> {
        match spec {
            TunnelSpec::Relay { host, token } => {
                if token.is_empty() {
                    return Err(TunnelError::MissingToken);
                }
                let options = RelayOptions::for_target(host)?;
                let handle = self
                    .launch_with_retry(RELAY_ATTEMPTS, || {
                        self.launcher.launch_relay(&options, token)
                    })
                    .await?;
                if let Some(tunnel_host) = &handle.host {
                    let label = tunnel_host.split('.').next().unwrap_or(tunnel_host);
                    println!(
                        "Connected private encrypted tunnel to {} ({})",
                        host, label
                    );
                }
                Ok(handle)
            }
            TunnelSpec::Vendor {
                username,
                access_key,
                tunnel_identifier,
            } => {
                self.launch_with_retry(VENDOR_ATTEMPTS, || {
                    self.launcher
                        .launch_vendor(username, access_key, tunnel_identifier.as_deref())
                })
                .await
            }
        }
    }

    async fn launch_with_retry<F, Fut>(
        &self,
        attempts: u32,
        mut launch: F,
    ) -> Result<TunnelHandle, TunnelError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<TunnelHandle, TunnelError>>,
    {
        let mut last = TunnelError::NotReady(attempts);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match launch().await {
                Ok(handle) => return Ok(handle),
                Err(err @ TunnelError::MissingToken) => return Err(err),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Tear down a tunnel. Safe to call on a detached handle.
    pub async fn disconnect(&self, mut handle: TunnelHandle) -> Result<(), TunnelError> {
        if let Some(child) = handle.child.as_mut() {
            child.kill().await?;
            let _ = child.wait().await;
        }
        Ok(())
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        TunnelManager::new()
    }
}

/// Rewrite `original` to point at the tunnel host, but only when its scheme
/// and host match the local target. URLs pointing elsewhere pass through
/// unchanged.
pub fn transform_url(original: &str, local_host: &str, tunnel_host: &str) -> String {
    let Ok(url) = Url::parse(original) else {
        return original.to_string();
    };
    let normalized = if local_host.contains("://") {
        local_host.to_string()
    } else {
        format!("http://{}", local_host)
    };
    let Ok(target) = Url::parse(&normalized) else {
        return original.to_string();
    };

    let host_with_port = |u: &Url| -> Option<String> {
        let host = u.host_str()?.to_ascii_lowercase();
        Some(match u.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        })
    };
    if url.scheme() != target.scheme() {
        return original.to_string();
    }
    match (host_with_port(&url), host_with_port(&target)) {
        (Some(a), Some(b)) if a == b => {}
        _ => return original.to_string(),
    }

    let (new_host, new_port) = match tunnel_host.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (tunnel_host, None),
        },
        None => (tunnel_host, None),
    };
    let mut rewritten = url;
    if rewritten.set_scheme("https").is_err() {
        return original.to_string();
    }
    if rewritten.set_host(Some(new_host)).is_err() {
        return original.to_string();
    }
    if rewritten.set_port(new_port).is_err() {
        return original.to_string();
    }
    rewritten.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingLauncher {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    impl CountingLauncher {
        fn failing() -> CountingLauncher {
            CountingLauncher {
                calls: Arc::new(AtomicU32::new(0)),
                succeed_on: u32::MAX,
            }
        }

        fn succeeding_on(attempt: u32) -> CountingLauncher {
            CountingLauncher {
                calls: Arc::new(AtomicU32::new(0)),
                succeed_on: attempt,
            }
        }

        fn attempt(&self) -> Result<TunnelHandle, TunnelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(TunnelHandle::detached(Some("abc123.tunnel.dev".to_string())))
            } else {
                Err(TunnelError::NotReady(1))
            }
        }
    }

    #[async_trait]
    impl TunnelLauncher for CountingLauncher {
        async fn launch_relay(
            &self,
            _options: &RelayOptions,
            _token: &str,
        ) -> Result<TunnelHandle, TunnelError> {
            self.attempt()
        }

        async fn launch_vendor(
            &self,
            _username: &str,
            _access_key: &str,
            _tunnel_identifier: Option<&str>,
        ) -> Result<TunnelHandle, TunnelError> {
            self.attempt()
        }
    }

    fn relay_spec(token: &str) -> TunnelSpec {
        TunnelSpec::Relay {
            host: "localhost:3000".to_string(),
            token: token.to_string(),
        }
    }

    #[test]
    fn test_relay_options_http_default_port() {
        let options = RelayOptions::for_target("myapp.local").unwrap();
        assert_eq!(options.addr, "myapp.local:80");
        assert_eq!(options.host_header, "myapp.local");
        assert!(options.bind_tls);
    }

    #[test]
    fn test_relay_options_http_custom_port() {
        let options = RelayOptions::for_target("localhost:3000").unwrap();
        assert_eq!(options.addr, "localhost:3000");
        assert_eq!(options.host_header, "localhost:3000");
    }

    #[test]
    fn test_relay_options_https_target() {
        let options = RelayOptions::for_target("https://secure.local").unwrap();
        assert_eq!(options.addr, "https://secure.local");
        assert_eq!(options.host_header, "rewrite");

        let with_port = RelayOptions::for_target("https://secure.local:8443").unwrap();
        assert_eq!(with_port.addr, "https://secure.local:8443");
    }

    #[tokio::test]
    async fn test_missing_token_fails_before_any_launch() {
        let launcher = CountingLauncher::failing();
        let calls = launcher.calls.clone();
        let manager = TunnelManager::with_launcher(Box::new(launcher));
        let err = manager.connect(&relay_spec("")).await.unwrap_err();
        assert!(matches!(err, TunnelError::MissingToken));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_launch_retries_until_success() {
        let manager = TunnelManager::with_launcher(Box::new(CountingLauncher::succeeding_on(3)));
        let handle = manager.connect(&relay_spec("tok")).await.unwrap();
        assert_eq!(handle.host.as_deref(), Some("abc123.tunnel.dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_launch_gives_up_after_budget() {
        let manager = TunnelManager::with_launcher(Box::new(CountingLauncher::failing()));
        let err = manager.connect(&relay_spec("tok")).await.unwrap_err();
        assert!(matches!(err, TunnelError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_disconnect_detached_handle() {
        let manager = TunnelManager::with_launcher(Box::new(CountingLauncher::failing()));
        let handle = TunnelHandle::detached(None);
        assert!(manager.disconnect(handle).await.is_ok());
    }

    #[test]
    fn test_public_https_host_picks_secure_tunnel() {
        let body = serde_json::json!({
            "tunnels": [
                {"public_url": "http://abc123.tunnel.dev"},
                {"public_url": "https://abc123.tunnel.dev"}
            ]
        });
        assert_eq!(
            public_https_host(&body).as_deref(),
            Some("abc123.tunnel.dev")
        );
        assert_eq!(public_https_host(&serde_json::json!({"tunnels": []})), None);
    }

    #[test]
    fn test_transform_url_rewrites_matching_host() {
        let rewritten = transform_url(
            "http://localhost:3000/dashboard?tab=1",
            "localhost:3000",
            "abc123.tunnel.dev",
        );
        assert_eq!(rewritten, "https://abc123.tunnel.dev/dashboard?tab=1");
    }

    #[test]
    fn test_transform_url_host_match_is_case_insensitive() {
        let rewritten = transform_url(
            "http://LOCALHOST:3000/",
            "localhost:3000",
            "abc123.tunnel.dev",
        );
        assert_eq!(rewritten, "https://abc123.tunnel.dev/");
    }

    #[test]
    fn test_transform_url_leaves_other_hosts_alone() {
        let original = "http://cdn.example.com/lib.js";
        assert_eq!(
            transform_url(original, "localhost:3000", "abc123.tunnel.dev"),
            original
        );
    }

    #[test]
    fn test_transform_url_requires_scheme_match() {
        let original = "https://localhost:3000/";
        assert_eq!(
            transform_url(original, "localhost:3000", "abc123.tunnel.dev"),
            original
        );
    }

    #[test]
    fn test_transform_url_ignores_port_mismatch() {
        let original = "http://localhost:8080/";
        assert_eq!(
            transform_url(original, "localhost:3000", "abc123.tunnel.dev"),
            original
        );
    }
}
