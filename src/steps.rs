//! Browser interaction steps
//!
//! A state's script is an ordered sequence of steps, serialized as
//! `{"type": ...}` tagged objects. The set of step types is closed: an
//! unrecognized type, or an extra field on a recognized type, rejects the
//! step rather than being silently ignored.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Element locator. The service only understands CSS selector locators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Locator {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Locator {
    /// CSS selector locator.
    pub fn css(selector: impl Into<String>) -> Self {
        Locator {
            kind: "css selector".to_string(),
            value: selector.into(),
        }
    }
}

/// One browser action within a state's script.
///
/// Each variant has a closed, fixed field set matching the wire format of
/// the remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Step {
    /// Navigate to a URL.
    Url { url: String },
    /// Capture a screenshot, optionally cropped to an element.
    SaveScreenshot {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        locator: Option<Locator>,
    },
    ClickElement {
        #[serde(skip_serializing_if = "Option::is_none")]
        locator: Option<Locator>,
        #[serde(rename = "maxTime", skip_serializing_if = "Option::is_none")]
        max_time: Option<u64>,
    },
    /// Hover over an element.
    MoveTo {
        #[serde(skip_serializing_if = "Option::is_none")]
        locator: Option<Locator>,
        #[serde(rename = "maxTime", skip_serializing_if = "Option::is_none")]
        max_time: Option<u64>,
    },
    /// Press and hold the pointer, optionally on an element.
    ClickAndHoldElement {
        #[serde(skip_serializing_if = "Option::is_none")]
        locator: Option<Locator>,
        #[serde(rename = "maxTime", skip_serializing_if = "Option::is_none")]
        max_time: Option<u64>,
    },
    /// Release a held pointer, optionally over an element.
    ReleaseElement {
        #[serde(skip_serializing_if = "Option::is_none")]
        locator: Option<Locator>,
        #[serde(rename = "maxTime", skip_serializing_if = "Option::is_none")]
        max_time: Option<u64>,
    },
    /// Set an element's text value. An empty `text` clears the value;
    /// `is_password` marks the value as sensitive.
    SetElementText {
        locator: Locator,
        text: String,
        #[serde(rename = "isPassword", skip_serializing_if = "Option::is_none")]
        is_password: Option<bool>,
    },
    /// Send raw key input, optionally focused on an element first.
    SendKeys {
        #[serde(skip_serializing_if = "Option::is_none")]
        locator: Option<Locator>,
        keys: String,
    },
    /// Run injected script. Asynchronous scripts must signal completion
    /// explicitly by calling `done()`.
    ExecuteScript {
        code: String,
        #[serde(rename = "isAsync", skip_serializing_if = "Option::is_none")]
        is_async: Option<bool>,
    },
    /// Add elements to the set of ignored regions.
    IgnoreElements { locator: Locator },
    /// Clear all previously ignored regions.
    ClearIgnores {},
    /// Pause for a fixed duration in milliseconds.
    Pause {
        #[serde(rename = "waitTime")]
        wait_time: u64,
    },
    WaitForElementPresent {
        locator: Locator,
        #[serde(rename = "maxTime", skip_serializing_if = "Option::is_none")]
        max_time: Option<u64>,
    },
    WaitForElementNotPresent {
        locator: Locator,
        #[serde(rename = "maxTime", skip_serializing_if = "Option::is_none")]
        max_time: Option<u64>,
    },
    /// Toggle CSS animation rendering.
    CssAnimations {
        #[serde(rename = "isEnabled")]
        is_enabled: bool,
    },
}

impl Step {
    /// Wire field names permitted for a given step type, excluding `type`
    /// itself. `None` means the type is not recognized.
    fn allowed_fields(kind: &str) -> Option<&'static [&'static str]> {
        Some(match kind {
            "url" => &["url"],
            "saveScreenshot" => &["name", "locator"],
            "clickElement" | "moveTo" | "clickAndHoldElement" | "releaseElement" => {
                &["locator", "maxTime"]
            }
            "setElementText" => &["locator", "text", "isPassword"],
            "sendKeys" => &["locator", "keys"],
            "executeScript" => &["code", "isAsync"],
            "ignoreElements" => &["locator"],
            "clearIgnores" => &[],
            "pause" => &["waitTime"],
            "waitForElementPresent" | "waitForElementNotPresent" => &["locator", "maxTime"],
            "cssAnimations" => &["isEnabled"],
            _ => return None,
        })
    }

    /// Whether this step produces an additional capture beyond the state's
    /// own screenshot.
    pub fn is_screenshot(&self) -> bool {
        matches!(self, Step::SaveScreenshot { .. })
    }
}

fn req_field<'a, E: de::Error>(
    obj: &'a serde_json::Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<&'a Value, E> {
    obj.get(field)
        .ok_or_else(|| E::custom(format!("`{}` step is missing required field `{}`", kind, field)))
}

fn req_string<E: de::Error>(
    obj: &serde_json::Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<String, E> {
    req_field(obj, kind, field)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| E::custom(format!("`{}` on `{}` step must be a string", field, kind)))
}

fn req_u64<E: de::Error>(
    obj: &serde_json::Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<u64, E> {
    req_field(obj, kind, field)?
        .as_u64()
        .ok_or_else(|| {
            E::custom(format!(
                "`{}` on `{}` step must be a non-negative integer",
                field, kind
            ))
        })
}

fn req_bool<E: de::Error>(
    obj: &serde_json::Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<bool, E> {
    req_field(obj, kind, field)?
        .as_bool()
        .ok_or_else(|| E::custom(format!("`{}` on `{}` step must be a boolean", field, kind)))
}

fn opt_u64<E: de::Error>(
    obj: &serde_json::Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<Option<u64>, E> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => req_u64(obj, kind, field).map(Some),
    }
}

fn opt_bool<E: de::Error>(
    obj: &serde_json::Map<String, Value>,
    kind: &str,
    field: &str,
) -> Result<Option<bool>, E> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => req_bool(obj, kind, field).map(Some),
    }
}

fn req_locator<E: de::Error>(
    obj: &serde_json::Map<String, Value>,
    kind: &str,
) -> Result<Locator, E> {
    let value = req_field(obj, kind, "locator")?;
    serde_json::from_value(value.clone())
        .map_err(|e| E::custom(format!("invalid locator on `{}` step: {}", kind, e)))
}

fn opt_locator<E: de::Error>(
    obj: &serde_json::Map<String, Value>,
    kind: &str,
) -> Result<Option<Locator>, E> {
    match obj.get("locator") {
        None | Some(Value::Null) => Ok(None),
        Some(_) => req_locator(obj, kind).map(Some),
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| de::Error::custom("step must be an object"))?;

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| de::Error::custom("step is missing a `type` field"))?;

        let allowed = Step::allowed_fields(kind)
            .ok_or_else(|| de::Error::custom(format!("unrecognized step type `{}`", kind)))?;

        for key in obj.keys() {
            if key != "type" && !allowed.contains(&key.as_str()) {
                return Err(de::Error::custom(format!(
                    "unknown field `{}` on `{}` step",
                    key, kind
                )));
            }
        }

        let step = match kind {
            "url" => Step::Url {
                url: req_string(obj, kind, "url")?,
            },
            "saveScreenshot" => Step::SaveScreenshot {
                name: req_string(obj, kind, "name")?,
                locator: opt_locator(obj, kind)?,
            },
            "clickElement" => Step::ClickElement {
                locator: opt_locator(obj, kind)?,
                max_time: opt_u64(obj, kind, "maxTime")?,
            },
            "moveTo" => Step::MoveTo {
                locator: opt_locator(obj, kind)?,
                max_time: opt_u64(obj, kind, "maxTime")?,
            },
            "clickAndHoldElement" => Step::ClickAndHoldElement {
                locator: opt_locator(obj, kind)?,
                max_time: opt_u64(obj, kind, "maxTime")?,
            },
            "releaseElement" => Step::ReleaseElement {
                locator: opt_locator(obj, kind)?,
                max_time: opt_u64(obj, kind, "maxTime")?,
            },
            "setElementText" => Step::SetElementText {
                locator: req_locator(obj, kind)?,
                text: req_string(obj, kind, "text")?,
                is_password: opt_bool(obj, kind, "isPassword")?,
            },
            "sendKeys" => Step::SendKeys {
                locator: opt_locator(obj, kind)?,
                keys: req_string(obj, kind, "keys")?,
            },
            "executeScript" => Step::ExecuteScript {
                code: req_string(obj, kind, "code")?,
                is_async: opt_bool(obj, kind, "isAsync")?,
            },
            "ignoreElements" => Step::IgnoreElements {
                locator: req_locator(obj, kind)?,
            },
            "clearIgnores" => Step::ClearIgnores {},
            "pause" => Step::Pause {
                wait_time: req_u64(obj, kind, "waitTime")?,
            },
            "waitForElementPresent" => Step::WaitForElementPresent {
                locator: req_locator(obj, kind)?,
                max_time: opt_u64(obj, kind, "maxTime")?,
            },
            "waitForElementNotPresent" => Step::WaitForElementNotPresent {
                locator: req_locator(obj, kind)?,
                max_time: opt_u64(obj, kind, "maxTime")?,
            },
            "cssAnimations" => Step::CssAnimations {
                is_enabled: req_bool(obj, kind, "isEnabled")?,
            },
            _ => unreachable!("allowed_fields covers every recognized type"),
        };

        Ok(step)
    }
}

/// Fluent builder producing a step sequence.
///
/// ```
/// use glimpse_runner::steps::StepBuilder;
///
/// let steps = StepBuilder::new()
///     .click(".open-menu")
///     .wait_for(".menu-panel")
///     .snapshot("Menu Open")
///     .end();
/// assert_eq!(steps.len(), 3);
/// ```
#[derive(Debug, Default)]
pub struct StepBuilder {
    steps: Vec<Step>,
}

impl StepBuilder {
    pub fn new() -> Self {
        StepBuilder::default()
    }

    /// Navigate to a URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.steps.push(Step::Url { url: url.into() });
        self
    }

    /// Capture a screenshot with the given name.
    pub fn snapshot(mut self, name: impl Into<String>) -> Self {
        self.steps.push(Step::SaveScreenshot {
            name: name.into(),
            locator: None,
        });
        self
    }

    /// Capture a screenshot cropped to an element.
    pub fn cropped_snapshot(mut self, name: impl Into<String>, selector: impl Into<String>) -> Self {
        self.steps.push(Step::SaveScreenshot {
            name: name.into(),
            locator: Some(Locator::css(selector)),
        });
        self
    }

    pub fn click(mut self, selector: impl Into<String>) -> Self {
        self.steps.push(Step::ClickElement {
            locator: Some(Locator::css(selector)),
            max_time: None,
        });
        self
    }

    pub fn hover(mut self, selector: impl Into<String>) -> Self {
        self.steps.push(Step::MoveTo {
            locator: Some(Locator::css(selector)),
            max_time: None,
        });
        self
    }

    pub fn press_and_hold(mut self, selector: impl Into<String>) -> Self {
        self.steps.push(Step::ClickAndHoldElement {
            locator: Some(Locator::css(selector)),
            max_time: None,
        });
        self
    }

    pub fn release(mut self) -> Self {
        self.steps.push(Step::ReleaseElement {
            locator: None,
            max_time: None,
        });
        self
    }

    pub fn set_value(mut self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        self.steps.push(Step::SetElementText {
            locator: Locator::css(selector),
            text: text.into(),
            is_password: None,
        });
        self
    }

    /// Like [`StepBuilder::set_value`] but marks the value as sensitive.
    pub fn set_secret(mut self, selector: impl Into<String>, text: impl Into<String>) -> Self {
        self.steps.push(Step::SetElementText {
            locator: Locator::css(selector),
            text: text.into(),
            is_password: Some(true),
        });
        self
    }

    pub fn clear_value(mut self, selector: impl Into<String>) -> Self {
        self.steps.push(Step::SetElementText {
            locator: Locator::css(selector),
            text: String::new(),
            is_password: None,
        });
        self
    }

    pub fn send_keys(mut self, selector: impl Into<String>, keys: impl Into<String>) -> Self {
        self.steps.push(Step::SendKeys {
            locator: Some(Locator::css(selector)),
            keys: keys.into(),
        });
        self
    }

    pub fn execute_script(mut self, code: impl Into<String>) -> Self {
        self.steps.push(Step::ExecuteScript {
            code: code.into(),
            is_async: None,
        });
        self
    }

    /// Run an asynchronous script; the script must call `done()` when
    /// finished.
    pub fn execute_async_script(mut self, code: impl Into<String>) -> Self {
        self.steps.push(Step::ExecuteScript {
            code: code.into(),
            is_async: Some(true),
        });
        self
    }

    pub fn ignore(mut self, selector: impl Into<String>) -> Self {
        self.steps.push(Step::IgnoreElements {
            locator: Locator::css(selector),
        });
        self
    }

    pub fn clear_ignores(mut self) -> Self {
        self.steps.push(Step::ClearIgnores {});
        self
    }

    /// Pause for a fixed number of milliseconds.
    pub fn wait_ms(mut self, ms: u64) -> Self {
        self.steps.push(Step::Pause { wait_time: ms });
        self
    }

    /// Wait for an element to be present.
    pub fn wait_for(mut self, selector: impl Into<String>) -> Self {
        self.steps.push(Step::WaitForElementPresent {
            locator: Locator::css(selector),
            max_time: None,
        });
        self
    }

    /// Wait for an element to be absent.
    pub fn wait_for_absent(mut self, selector: impl Into<String>) -> Self {
        self.steps.push(Step::WaitForElementNotPresent {
            locator: Locator::css(selector),
            max_time: None,
        });
        self
    }

    pub fn css_animations(mut self, enabled: bool) -> Self {
        self.steps.push(Step::CssAnimations {
            is_enabled: enabled,
        });
        self
    }

    /// Finish the chain and return the step sequence.
    pub fn end(self) -> Vec<Step> {
        self.steps
    }
}
