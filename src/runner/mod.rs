//! Build orchestration
//!
//! Drives a full run: validate, filter states, inject CI variables, bring up
//! the tunnel and proxy when asked for, submit the build, poll it to a
//! terminal status, and tear the tunnel down on every exit path.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::api::{ApiClient, ApiError, BuildHandle};
use crate::ci;
use crate::config::{validate, ConfigError, Resolution, RunConfig, UiState};
use crate::proxy::{self, ProxyError, ProxyOptions, ProxyServer};
use crate::rules;
use crate::steps::Step;
use crate::tunnel::{self, TunnelError, TunnelHandle, TunnelManager, TunnelSpec};

/// Wall-clock ceiling for each of the submit and poll phases.
const MAX_WAIT: Duration = Duration::from_secs(30 * 60);

/// Keep-alive output interval so quiet CI jobs are not killed.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Timeout waiting for Build")]
    Timeout,

    /// Terminal status reported a failing build; carries the full status
    /// text.
    #[error("{0}")]
    BuildFailed(String),
}

/// Outcome of a run that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Filtering left nothing to capture. Deliberate per-branch filtering is
    /// not a failure.
    NoStates,
    /// The build reached a passing terminal status, returned verbatim.
    Completed { status: String },
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub verbose: bool,
    pub max_wait: Duration,
    pub progress_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            verbose: false,
            max_wait: MAX_WAIT,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

pub struct Runner {
    api: ApiClient,
    tunnels: TunnelManager,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(api: ApiClient) -> Runner {
        Runner {
            api,
            tunnels: TunnelManager::new(),
            options: RunnerOptions::default(),
        }
    }

    pub fn with_tunnel_manager(mut self, tunnels: TunnelManager) -> Self {
        self.tunnels = tunnels;
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Execute a full run. The caller's configuration is not mutated.
    pub async fn run(&self, config: &RunConfig) -> Result<RunOutcome, RunnerError> {
        let mut config = config.clone();
        validate(&config)?;

        config.states = rules::filter(
            &config.states,
            |state| state.name.as_str(),
            config.include_rules.as_deref(),
            config.exclude_rules.as_deref(),
        );
        if config.states.is_empty() {
            println!("No UI states to test. Skipping build.");
            return Ok(RunOutcome::NoStates);
        }

        ci::merge_vars(&mut config, ci::detect());

        config
            .meta
            .get_or_insert_with(BTreeMap::new)
            .insert("glimpse-runner".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let mut proxy_server: Option<ProxyServer> = None;
        let mut connect_spec: Option<TunnelSpec> = None;
        if let Some(tunnel_config) = &config.tunnel {
            let token = match &tunnel_config.token {
                Some(token) => Some(token.clone()),
                None => self.fetch_tunnel_token().await?,
            };
            let mut target = tunnel_config.host.clone();
            if tunnel_config.gzip.unwrap_or(false) {
                let server = proxy::start_server(ProxyOptions {
                    target_host: tunnel_config.host.clone(),
                    cache: tunnel_config.cache.unwrap_or(false),
                })
                .await?;
                target = server.host.clone();
                proxy_server = Some(server);
            }
            connect_spec = Some(TunnelSpec::Relay {
                host: target,
                token: token.unwrap_or_default(),
            });
        } else if let Some(sauce) = &config.sauce {
            if sauce.launch_tunnel.unwrap_or(false) {
                connect_spec = Some(TunnelSpec::Vendor {
                    username: sauce.username.clone(),
                    access_key: sauce.access_key.clone(),
                    tunnel_identifier: sauce.tunnel_identifier.clone(),
                });
            }
        }

        let mut tunnel_handle: Option<TunnelHandle> = None;
        if let Some(spec) = &connect_spec {
            println!("Connecting tunnel");
            match self.tunnels.connect(spec).await {
                Ok(handle) => tunnel_handle = Some(handle),
                Err(err) => {
                    if let Some(server) = proxy_server.take() {
                        server.shutdown();
                    }
                    return Err(err.into());
                }
            }
        }

        if let (Some(handle), Some(tunnel_config)) = (&tunnel_handle, &config.tunnel) {
            if let Some(tunnel_host) = &handle.host {
                rewrite_states(&mut config.states, &tunnel_config.host, tunnel_host);
            }
        }

        let result = self.submit_and_wait(&config).await;

        // Teardown is unconditional; failures here are reported but never
        // mask the run's own result.
        if let Some(server) = proxy_server.take() {
            server.shutdown();
        }
        if let Some(handle) = tunnel_handle.take() {
            println!("Disconnecting tunnel");
            if let Err(err) = self.tunnels.disconnect(handle).await {
                eprintln!("warning: tunnel teardown failed: {}", err);
            }
        }

        let status = result?;
        if is_failure_status(&status, config.failure_exit_code) {
            return Err(RunnerError::BuildFailed(status));
        }
        Ok(RunOutcome::Completed { status })
    }

    /// The token endpoint occasionally answers without a token while one is
    /// being provisioned, so an empty answer gets one more try.
    async fn fetch_tunnel_token(&self) -> Result<Option<String>, RunnerError> {
        match self.api.get_tunnel_token().await? {
            Some(token) => Ok(Some(token)),
            None => Ok(self.api.get_tunnel_token().await?),
        }
    }

    async fn submit_and_wait(&self, config: &RunConfig) -> Result<String, RunnerError> {
        self.print_banner(config);

        let payload = config.to_payload();
        if self.options.verbose {
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_default()
            );
        }

        println!("\nCreating build for {}", config.project_repo);
        let handle: BuildHandle = tokio::time::timeout(
            self.options.max_wait,
            self.api.create_build_with_retry(&payload),
        )
        .await
        .map_err(|_| RunnerError::Timeout)??;

        println!(
            "Waiting for build #{} on {} to complete...\n",
            handle.build, handle.branch
        );
        println!("View progress via the Glimpse dashboard => https://app.glimpse.dev\n");

        let interval = self.options.progress_interval;
        let progress = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                println!(".");
            }
        });
        let status =
            tokio::time::timeout(self.options.max_wait, self.api.wait_for_build(&handle)).await;
        progress.abort();

        Ok(status.map_err(|_| RunnerError::Timeout)??)
    }

    fn print_banner(&self, config: &RunConfig) {
        let total = config.total_captures();
        let plural = if total == 1 { "" } else { "s" };
        let per = if config.browsers.is_some() {
            "browser/resolution"
        } else {
            "resolution"
        };
        println!("\n{} UI state{} to capture per {}", total, plural, per);

        if let Some(browsers) = &config.browsers {
            println!("Browsers:");
            for (index, browser) in browsers.iter().enumerate() {
                println!("  {}. {}", index + 1, browser.display());
            }
        }

        let single = config.resolution.as_ref().map(std::slice::from_ref);
        let resolutions: Option<&[Resolution]> =
            config.resolutions.as_deref().or(single);
        if let Some(resolutions) = resolutions {
            println!("Resolutions:");
            for (index, resolution) in resolutions.iter().enumerate() {
                println!("  {}. {}", index + 1, resolution.display());
            }
        }
    }
}

/// Route every state URL and navigate-step URL that targets the local host
/// through the tunnel.
fn rewrite_states(states: &mut [UiState], local_host: &str, tunnel_host: &str) {
    for state in states {
        state.url = tunnel::transform_url(&state.url, local_host, tunnel_host);
        if let Some(steps) = &mut state.steps {
            for step in steps {
                if let Step::Url { url } = step {
                    *url = tunnel::transform_url(url, local_host, tunnel_host);
                }
            }
        }
    }
}

/// Terminal-status mapping. Any non-empty status without a known failure
/// marker counts as success. A failing build is tolerated when the caller
/// zeroed the failure exit code, unless the status reports a run error.
fn is_failure_status(status: &str, failure_exit_code: i64) -> bool {
    status.contains("Build failed.")
        && (failure_exit_code != 0 || status.contains("error running"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepBuilder;

    #[test]
    fn test_failure_status_mapping() {
        assert!(is_failure_status("Build failed. 2 changes rejected.", 1));
        assert!(!is_failure_status("Build passed.", 1));
        assert!(!is_failure_status("Build failed. 2 changes rejected.", 0));
        assert!(is_failure_status("Build failed. error running state", 0));
    }

    #[test]
    fn test_rewrite_states_touches_state_and_step_urls() {
        let steps = StepBuilder::new()
            .url("http://localhost:3000/settings")
            .url("http://cdn.example.com/lib.js")
            .snapshot("Settings")
            .end();
        let mut states = vec![UiState {
            url: "http://localhost:3000/".to_string(),
            name: "Home".to_string(),
            steps: Some(steps),
            shots_index: None,
        }];
        rewrite_states(&mut states, "localhost:3000", "abc123.tunnel.dev");

        assert_eq!(states[0].url, "https://abc123.tunnel.dev/");
        let steps = states[0].steps.as_ref().unwrap();
        assert!(
            matches!(&steps[0], Step::Url { url } if url == "https://abc123.tunnel.dev/settings")
        );
        assert!(matches!(&steps[1], Step::Url { url } if url == "http://cdn.example.com/lib.js"));
    }
}
