//! Typed accessors over a task's free-form `params` table.

use regex::Regex;
use serde_json::{Map, Value};

use super::HttpEndpoint;
use crate::config::ConfigError;

/// Raw `params` table as read from the settings file.
pub type ProbeParams = Map<String, Value>;

pub fn required_str<'a>(params: &'a ProbeParams, key: &str) -> Result<&'a str, ConfigError> {
    optional_str(params, key)?.ok_or_else(|| ConfigError::MissingParam(key.to_string()))
}

pub fn optional_str<'a>(
    params: &'a ProbeParams,
    key: &str,
) -> Result<Option<&'a str>, ConfigError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(other) => Err(ConfigError::invalid_param(
            key,
            format!("expected a string, found {other}"),
        )),
    }
}

pub fn optional_u64(params: &ProbeParams, key: &str, default: u64) -> Result<u64, ConfigError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| ConfigError::invalid_param(key, "expected a non-negative integer")),
    }
}

pub fn required_pattern(params: &ProbeParams, key: &str) -> Result<Regex, ConfigError> {
    optional_pattern(params, key)?.ok_or_else(|| ConfigError::MissingParam(key.to_string()))
}

/// Invalid patterns are configuration errors, not silently ignored.
pub fn optional_pattern(params: &ProbeParams, key: &str) -> Result<Option<Regex>, ConfigError> {
    optional_str(params, key)?
        .filter(|raw| !raw.is_empty())
        .map(|raw| Regex::new(raw).map_err(|err| ConfigError::invalid_param(key, err)))
        .transpose()
}

pub fn required_endpoint(params: &ProbeParams, key: &str) -> Result<HttpEndpoint, ConfigError> {
    match params.get(key) {
        Some(Value::Object(table)) => HttpEndpoint::from_params(table)
            .map_err(|err| ConfigError::invalid_param(key, err)),
        Some(_) => Err(ConfigError::invalid_param(key, "expected a table")),
        None => Err(ConfigError::MissingParam(key.to_string())),
    }
}
