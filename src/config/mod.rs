//! Settings and configuration module
//!
//! Provides the TOML settings file model with:
//! - Serde defaults for every knob
//! - Environment overrides for secrets and hosts
//! - Startup validation that runs before any task is registered

mod settings;

pub use settings::{
    ConfigError, DEFAULT_SETTINGS_PATH, NAME_PLACEHOLDER, ProxySettings, PublicProxySettings,
    Secret, SessionProxySettings, Settings, StickySettings, TaskSettings, ENV_API_HOST,
    ENV_API_SECRET, ENV_PROXY_URL,
};
