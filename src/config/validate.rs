//! Configuration validation
//!
//! Cross-field constraint checks applied after parsing, before any network
//! traffic. Errors carry the failing field and the violated constraint.

use regex_lite::Regex;
use url::Url;

use super::{Resolution, RunConfig};

/// Browsers that may be requested without an external browser grid.
const FREE_BROWSERS: &[&str] = &["chrome", "firefox"];

/// Configuration error: the run aborts before any request is made.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{field}`: {constraint}")]
    Invalid { field: String, constraint: String },

    #[error("`{first}` conflicts with `{second}`")]
    PeerConflict {
        first: &'static str,
        second: &'static str,
    },

    #[error("`{field}` requires `{requires}`")]
    MissingPeer {
        field: &'static str,
        requires: &'static str,
    },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    if value.chars().count() > max {
        return Err(ConfigError::invalid(
            field,
            format!("must be at most {} characters", max),
        ));
    }
    Ok(())
}

fn check_dimensions(field: &str, value: &str) -> Result<(), ConfigError> {
    let pattern = Regex::new(r"^[0-9]{3,4}x[0-9]{3,4}$").expect("static pattern compiles");
    if !pattern.is_match(value) {
        return Err(ConfigError::invalid(
            field,
            "must match <width>x<height>, e.g. 1024x768",
        ));
    }
    Ok(())
}

fn check_resolution(field: &str, resolution: &Resolution) -> Result<(), ConfigError> {
    match resolution {
        Resolution::Dimensions(s) => check_dimensions(field, s),
        Resolution::Device(_) | Resolution::Size(_) => Ok(()),
    }
}

/// Validate the full run configuration. The first violated constraint is
/// returned.
pub fn validate(config: &RunConfig) -> Result<(), ConfigError> {
    if config.api_key.is_empty() {
        return Err(ConfigError::invalid("apiKey", "must not be empty"));
    }
    check_len("projectRepo", &config.project_repo, 100)?;

    if let Some(build) = &config.build {
        if build.chars().count() > 40 {
            return Err(ConfigError::invalid(
                "build",
                "must be at most 40 characters",
            ));
        }
    }
    if let Some(branch) = &config.branch {
        if branch.chars().count() > 100 {
            return Err(ConfigError::invalid(
                "branch",
                "must be at most 100 characters",
            ));
        }
    }

    for (index, state) in config.states.iter().enumerate() {
        check_len(&format!("states[{}].name", index), &state.name, 200)?;
        if Url::parse(&state.url).is_err() {
            return Err(ConfigError::invalid(
                format!("states[{}].url", index),
                "must be a valid URL with an explicit scheme",
            ));
        }
    }

    if config.resolution.is_some() && config.resolutions.is_some() {
        return Err(ConfigError::PeerConflict {
            first: "resolution",
            second: "resolutions",
        });
    }
    if let Some(resolution) = &config.resolution {
        check_resolution("resolution", resolution)?;
    }
    if let Some(resolutions) = &config.resolutions {
        for (index, resolution) in resolutions.iter().enumerate() {
            check_resolution(&format!("resolutions[{}]", index), resolution)?;
        }
    }

    if config.sauce.is_some() && config.browser_stack.is_some() {
        return Err(ConfigError::PeerConflict {
            first: "sauce",
            second: "browserStack",
        });
    }

    let launches_vendor_tunnel = config
        .sauce
        .as_ref()
        .and_then(|s| s.launch_tunnel)
        .unwrap_or(false);
    if launches_vendor_tunnel && config.tunnel.is_some() {
        return Err(ConfigError::PeerConflict {
            first: "sauce.launchTunnel",
            second: "tunnel",
        });
    }

    if let Some(tunnel) = &config.tunnel {
        if tunnel.host.is_empty() {
            return Err(ConfigError::invalid("tunnel.host", "must not be empty"));
        }
    }

    if config.base_branch.is_none() {
        let baseline_flags: [(&'static str, Option<bool>); 3] = [
            ("disableBranchBaseline", config.disable_branch_baseline),
            ("useNewerBaseBranch", config.use_newer_base_branch),
            ("alwaysAcceptBaseBranch", config.always_accept_base_branch),
        ];
        for (field, flag) in baseline_flags {
            if flag.unwrap_or(false) {
                return Err(ConfigError::MissingPeer {
                    field,
                    requires: "baseBranch",
                });
            }
        }
    }

    if let Some(browsers) = &config.browsers {
        let has_grid = config.sauce.is_some() || config.browser_stack.is_some();
        let all_free = browsers
            .iter()
            .all(|b| FREE_BROWSERS.contains(&b.browser_name.to_lowercase().as_str()));
        if !has_grid && !all_free {
            return Err(ConfigError::MissingPeer {
                field: "browsers",
                requires: "sauce or browserStack",
            });
        }
        for (index, browser) in browsers.iter().enumerate() {
            if browser.browser_name.is_empty() {
                return Err(ConfigError::invalid(
                    format!("browsers[{}].browserName", index),
                    "must not be empty",
                ));
            }
        }
    }

    if !(0..=255).contains(&config.failure_exit_code) {
        return Err(ConfigError::invalid(
            "failureExitCode",
            "must be an integer between 0 and 255",
        ));
    }

    Ok(())
}
