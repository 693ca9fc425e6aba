//! Run configuration data model
//!
//! The top-level request submitted by a CI job: credentials, the project
//! under test, the UI states to capture, optional browser/resolution
//! matrices, filter rules, tunnel settings, and diff behavior options.
//! Field names follow the service's camelCase wire format.

pub mod validate;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rules::FilterRule;
use crate::steps::Step;

pub use validate::{validate, ConfigError};

/// One capturable UI condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UiState {
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    /// Index into a pre-captured screenshot set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shots_index: Option<u32>,
}

/// Browser request, optionally carrying its own state filter rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Browser {
    pub browser_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_rules: Option<Vec<FilterRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_rules: Option<Vec<FilterRule>>,
}

impl Browser {
    /// Human-readable label for console output.
    pub fn display(&self) -> String {
        let name = match self.browser_name.to_lowercase().as_str() {
            "chrome" => "Chrome",
            "firefox" => "Firefox",
            "safari" => "Safari",
            "microsoftedge" => "Microsoft Edge",
            "internet explorer" => "Internet Explorer",
            other => return maybe_version(other, &self.version),
        };
        maybe_version(name, &self.version)
    }
}

fn maybe_version(name: &str, version: &Option<String>) -> String {
    match version {
        Some(v) => format!("{} {}", name, v),
        None => name.to_string(),
    }
}

/// A named device screen, optionally carrying its own state filter rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceResolution {
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_orientation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_rules: Option<Vec<FilterRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_rules: Option<Vec<FilterRule>>,
}

/// An explicit viewport size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FixedSize {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_rules: Option<Vec<FilterRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_rules: Option<Vec<FilterRule>>,
}

/// A capture resolution: a `"1024x768"` string, a named device, or an
/// explicit width/height pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resolution {
    Dimensions(String),
    Device(DeviceResolution),
    Size(FixedSize),
}

impl Resolution {
    /// Human-readable label for console output.
    pub fn display(&self) -> String {
        match self {
            Resolution::Dimensions(s) => s.clone(),
            Resolution::Device(d) => d.device_name.clone(),
            Resolution::Size(s) => format!("{}x{}", s.width, s.height),
        }
    }
}

/// Relay tunnel configuration. The launch token is fetched from the
/// service when not supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TunnelConfig {
    /// Local target to expose, `host` or `host:port`.
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gzip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Sauce Labs credentials, optionally launching a vendor-managed tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SauceConfig {
    pub username: String,
    pub access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_tunnel: Option<bool>,
    /// Identifier used to multiplex one tunnel across rule sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_identifier: Option<String>,
}

/// BrowserStack credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BrowserStackConfig {
    pub username: String,
    pub access_key: String,
}

/// Visual comparison behavior toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiffOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<bool>,
}

fn default_failure_exit_code() -> i64 {
    1
}

/// The full run request. Unknown top-level fields are rejected at parse
/// time; cross-field constraints are checked by [`validate::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfig {
    pub api_key: String,
    pub project_repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    pub states: Vec<UiState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browsers: Option<Vec<Browser>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolutions: Option<Vec<Resolution>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_rules: Option<Vec<FilterRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_rules: Option<Vec<FilterRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sauce: Option<SauceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_stack: Option<BrowserStackConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_branch_baseline: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_newer_base_branch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_accept_base_branch: Option<bool>,
    /// Comma-delimited CSS selectors ignored in every state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,
    /// Comma-delimited CSS selectors hidden in every state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide: Option<String>,
    /// Script source injected before each state's steps run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_each_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_options: Option<DiffOptions>,
    /// Process exit code used on failure; 0 downgrades failures to success.
    #[serde(default = "default_failure_exit_code")]
    pub failure_exit_code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<BTreeMap<String, String>>,
}

/// Keys stripped from the outbound payload. These drive the client itself
/// and are never sent to the service.
const CLIENT_ONLY_KEYS: &[&str] = &[
    "apiKey",
    "resolution",
    "resolutions",
    "includeRules",
    "excludeRules",
    "tunnel",
    "failureExitCode",
];

impl RunConfig {
    /// Load a configuration from a JSON or TOML file, selected by
    /// extension.
    pub fn from_file(path: &Path) -> Result<RunConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string())),
            _ => serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string())),
        }
    }

    /// Build the outbound build-creation payload.
    ///
    /// Client-only fields are excluded; `resolution`/`resolutions` collapse
    /// into a single `resolutions` list; the vendor tunnel launch flag is
    /// stripped from the credentials block.
    pub fn to_payload(&self) -> Value {
        let mut value = serde_json::to_value(self).expect("config serializes");
        let obj = value.as_object_mut().expect("config is a JSON object");

        let merged_resolutions: Option<Vec<Resolution>> = match (&self.resolution, &self.resolutions)
        {
            (_, Some(list)) => Some(list.clone()),
            (Some(single), None) => Some(vec![single.clone()]),
            (None, None) => None,
        };

        for key in CLIENT_ONLY_KEYS {
            obj.remove(*key);
        }

        if let Some(resolutions) = merged_resolutions {
            obj.insert(
                "resolutions".to_string(),
                serde_json::to_value(resolutions).expect("resolutions serialize"),
            );
        }

        if let Some(sauce) = obj.get_mut("sauce").and_then(Value::as_object_mut) {
            sauce.remove("launchTunnel");
        }

        value
    }

    /// Number of captures a single browser/resolution combination produces:
    /// one per state plus one per screenshot step.
    pub fn total_captures(&self) -> usize {
        self.states
            .iter()
            .map(|state| {
                1 + state
                    .steps
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .filter(|s| s.is_screenshot())
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn minimal_config() -> RunConfig {
        serde_json::from_value(json!({
            "apiKey": "key-123",
            "projectRepo": "acme/storefront",
            "states": [
                {"url": "http://localhost:3000/", "name": "Home"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_minimal_config_parses() {
        let config = minimal_config();
        assert_eq!(config.project_repo, "acme/storefront");
        assert_eq!(config.failure_exit_code, 1);
        assert_eq!(config.states.len(), 1);
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let result: Result<RunConfig, _> = serde_json::from_value(json!({
            "apiKey": "k",
            "projectRepo": "r",
            "states": [],
            "screenshotDelay": 5
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_payload_excludes_client_only_fields() {
        let mut config = minimal_config();
        config.include_rules = Some(vec![crate::rules::FilterRule::Literal("Home".into())]);
        config.tunnel = Some(TunnelConfig {
            host: "localhost:3000".to_string(),
            gzip: Some(true),
            cache: None,
            token: None,
        });

        let payload = config.to_payload();
        let obj = payload.as_object().unwrap();
        assert!(!obj.contains_key("apiKey"));
        assert!(!obj.contains_key("includeRules"));
        assert!(!obj.contains_key("excludeRules"));
        assert!(!obj.contains_key("tunnel"));
        assert!(!obj.contains_key("failureExitCode"));
        assert!(obj.contains_key("projectRepo"));
        assert!(obj.contains_key("states"));
    }

    #[test]
    fn test_payload_merges_single_resolution_into_list() {
        let mut config = minimal_config();
        config.resolution = Some(Resolution::Dimensions("1280x1024".to_string()));

        let payload = config.to_payload();
        assert_eq!(payload["resolutions"], json!(["1280x1024"]));
        assert!(payload.get("resolution").is_none());
    }

    #[test]
    fn test_payload_keeps_resolution_list() {
        let mut config = minimal_config();
        config.resolutions = Some(vec![
            Resolution::Dimensions("1024x768".to_string()),
            Resolution::Device(DeviceResolution {
                device_name: "iPhone 15".to_string(),
                device_orientation: None,
                include_rules: None,
                exclude_rules: None,
            }),
        ]);

        let payload = config.to_payload();
        assert_eq!(
            payload["resolutions"],
            json!(["1024x768", {"deviceName": "iPhone 15"}])
        );
    }

    #[test]
    fn test_payload_strips_vendor_launch_flag() {
        let mut config = minimal_config();
        config.sauce = Some(SauceConfig {
            username: "user".to_string(),
            access_key: "ak".to_string(),
            max_concurrent: None,
            launch_tunnel: Some(true),
            tunnel_identifier: Some("shared".to_string()),
        });

        let payload = config.to_payload();
        assert!(payload["sauce"].get("launchTunnel").is_none());
        assert_eq!(payload["sauce"]["username"], "user");
    }

    #[test]
    fn test_payload_rules_serialize_as_records() {
        let mut config = minimal_config();
        config.browsers = Some(vec![Browser {
            browser_name: "chrome".to_string(),
            version: None,
            include_rules: Some(vec![crate::rules::FilterRule::pattern("^Home", "i")]),
            exclude_rules: None,
        }]);

        let payload = config.to_payload();
        assert_eq!(
            payload["browsers"][0]["includeRules"][0],
            json!({"source": "^Home", "flags": "i"})
        );
    }

    #[test]
    fn test_total_captures_counts_screenshot_steps() {
        let mut config = minimal_config();
        config.states.push(UiState {
            url: "http://localhost:3000/about".to_string(),
            name: "About".to_string(),
            steps: Some(
                crate::steps::StepBuilder::new()
                    .click(".open")
                    .snapshot("Opened")
                    .snapshot("Opened Again")
                    .end(),
            ),
            shots_index: None,
        });
        assert_eq!(config.total_captures(), 4);
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(
            Resolution::Dimensions("1024x768".to_string()).display(),
            "1024x768"
        );
        assert_eq!(
            Resolution::Size(FixedSize {
                width: 800,
                height: 600,
                include_rules: None,
                exclude_rules: None
            })
            .display(),
            "800x600"
        );
    }

    #[test]
    fn test_browser_display() {
        let browser = Browser {
            browser_name: "microsoftedge".to_string(),
            version: Some("120".to_string()),
            include_rules: None,
            exclude_rules: None,
        };
        assert_eq!(browser.display(), "Microsoft Edge 120");
    }

    #[test]
    fn test_toml_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glimpse.toml");
        std::fs::write(
            &path,
            r#"
apiKey = "key-123"
projectRepo = "acme/storefront"

[[states]]
url = "http://localhost:3000/"
name = "Home"
"#,
        )
        .unwrap();

        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(config.states[0].name, "Home");
    }
}
