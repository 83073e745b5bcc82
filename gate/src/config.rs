use crate::client::DeviceContext;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PUSH_TOKEN_FALLBACK: &str = "push_token_unavailable";
pub const DEFAULT_PROJECT_ID_FALLBACK: &str = "project_id_unavailable";
const DEFAULT_LOCALE: &str = "en_US";

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("request_timeout_secs cannot be 0")]
    ZeroRequestTimeout,

    #[error("redirects.max_hops cannot be 0")]
    ZeroMaxHops,

    #[error("redirects.hop_timeout_secs cannot be 0")]
    ZeroHopTimeout,

    #[error("device.platform cannot be empty")]
    EmptyPlatform,

    #[error("fallback value for {0} cannot be empty")]
    EmptyFallback(&'static str),
}

/// Gate configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Routing config endpoint. Deliberately a plain string: a placeholder
    /// value must load and surface as "not configured" at fetch time.
    pub endpoint: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Minimum time the loading state stays visible per fetch cycle
    #[serde(default = "default_min_loading_ms")]
    pub min_loading_ms: u64,
    /// Coalescing window for attribution change triggers
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_prompt_cooldown_secs")]
    pub prompt_cooldown_secs: u64,
    #[serde(default)]
    pub device: DeviceProfile,
    #[serde(default)]
    pub fallbacks: Fallbacks,
    #[serde(default)]
    pub redirects: RedirectLimits,
}

impl Config {
    /// A configuration with every optional field at its default.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Config {
            endpoint: endpoint.into(),
            request_timeout_secs: default_request_timeout_secs(),
            min_loading_ms: default_min_loading_ms(),
            debounce_ms: default_debounce_ms(),
            prompt_cooldown_secs: default_prompt_cooldown_secs(),
            device: DeviceProfile::default(),
            fallbacks: Fallbacks::default(),
            redirects: RedirectLimits::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::ZeroRequestTimeout);
        }
        if self.device.platform.trim().is_empty() {
            return Err(ValidationError::EmptyPlatform);
        }
        if self.fallbacks.push_token.is_empty() {
            return Err(ValidationError::EmptyFallback("push_token"));
        }
        if self.fallbacks.project_id.is_empty() {
            return Err(ValidationError::EmptyFallback("project_id"));
        }
        self.redirects.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn prompt_cooldown(&self) -> Duration {
        Duration::from_secs(self.prompt_cooldown_secs)
    }

    pub fn timings(&self) -> GateTimings {
        GateTimings {
            min_loading: Duration::from_millis(self.min_loading_ms),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

/// Timing knobs of the gate controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateTimings {
    pub min_loading: Duration,
    pub debounce: Duration,
}

impl Default for GateTimings {
    fn default() -> Self {
        GateTimings {
            min_loading: Duration::from_millis(default_min_loading_ms()),
            debounce: Duration::from_millis(default_debounce_ms()),
        }
    }
}

/// Static facts about the device and app sent with every routing request.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DeviceProfile {
    pub bundle_id: Option<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Falls back to `$LANG`, then `en_US`
    pub locale: Option<String>,
    pub store_id: Option<String>,
    pub project_id: Option<String>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            bundle_id: None,
            platform: default_platform(),
            locale: None,
            store_id: None,
            project_id: None,
        }
    }
}

impl DeviceProfile {
    pub fn locale(&self) -> String {
        self.locale
            .clone()
            .or_else(|| std::env::var("LANG").ok().and_then(|lang| posix_locale(&lang)))
            .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
    }

    /// Builds the per-request context with the push token known right now.
    pub fn context(&self, push_token: Option<String>) -> DeviceContext {
        DeviceContext {
            bundle_id: self.bundle_id.clone(),
            platform: self.platform.clone(),
            locale: self.locale(),
            store_id: self.store_id.clone(),
            push_token,
            project_id: self.project_id.clone(),
        }
    }
}

/// Turns `en_US.UTF-8` or `de_DE@euro` into `en_US` / `de_DE`. The C and POSIX
/// locales carry no language information.
fn posix_locale(value: &str) -> Option<String> {
    let locale = value.split(['.', '@']).next().unwrap_or_default().trim();
    match locale {
        "" | "C" | "POSIX" => None,
        locale => Some(locale.to_string()),
    }
}

/// Literals sent in place of values the device genuinely does not have.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Fallbacks {
    #[serde(default = "default_push_token_fallback")]
    pub push_token: String,
    #[serde(default = "default_project_id_fallback")]
    pub project_id: String,
}

impl Default for Fallbacks {
    fn default() -> Self {
        Fallbacks {
            push_token: default_push_token_fallback(),
            project_id: default_project_id_fallback(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RedirectLimits {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_hop_timeout_secs")]
    pub hop_timeout_secs: u64,
}

impl Default for RedirectLimits {
    fn default() -> Self {
        RedirectLimits {
            max_hops: default_max_hops(),
            hop_timeout_secs: default_hop_timeout_secs(),
        }
    }
}

impl RedirectLimits {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_hops == 0 {
            return Err(ValidationError::ZeroMaxHops);
        }
        if self.hop_timeout_secs == 0 {
            return Err(ValidationError::ZeroHopTimeout);
        }
        Ok(())
    }

    pub fn hop_timeout(&self) -> Duration {
        Duration::from_secs(self.hop_timeout_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_min_loading_ms() -> u64 {
    2_000
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_prompt_cooldown_secs() -> u64 {
    3 * 24 * 60 * 60
}

fn default_platform() -> String {
    "iOS".to_string()
}

fn default_push_token_fallback() -> String {
    DEFAULT_PUSH_TOKEN_FALLBACK.to_string()
}

fn default_project_id_fallback() -> String {
    DEFAULT_PROJECT_ID_FALLBACK.to_string()
}

fn default_max_hops() -> usize {
    80
}

fn default_hop_timeout_secs() -> u64 {
    8
}
