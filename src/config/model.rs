//! Data model for the documents under `~/.clp/`.
//!
//! Parsing is permissive: any field this crate doesn't know about is kept in
//! `extra` and re-serialized verbatim, so `parse(serialize(D)) == D` even for
//! a document written by a newer version of the config editor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the three proxy families. Used as a map key in routing and
/// load-balance documents, and to select which `<family>.json` file a
/// given `UpstreamConfig` set lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Claude,
    Codex,
    Legacy,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Claude => "claude",
            Family::Codex => "codex",
            Family::Legacy => "legacy",
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Family::Claude => 3210,
            Family::Codex => 3211,
            Family::Legacy => 3212,
        }
    }
}

/// Tri-state streaming policy for an upstream config (spec §3, §9).
///
/// `None` = follow the client's request; `Some(true)` = always stream to the
/// client (synthesizing from JSON if the upstream can't); `Some(false)` =
/// never stream to the client.
pub type StreamingMode = Option<bool>;

/// One named credential + base URL + policy entry within a family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_limit: Option<u32>,
    #[serde(default)]
    pub streaming: StreamingMode,
    /// Unknown / family-specific fields, preserved verbatim across round-trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("upstream config {name:?}: base_url must be http(s): {url}")]
    BadBaseUrl { name: String, url: String },
    #[error("upstream config {name:?}: exactly one of auth_token/api_key must be set")]
    CredentialAmbiguous { name: String },
}

impl UpstreamConfig {
    /// Exactly one of `auth_token` / `api_key` must be a non-empty string
    /// (spec §3 invariant, §8 invariant 1).
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let has_token = self.auth_token.as_deref().is_some_and(|s| !s.is_empty());
        let has_key = self.api_key.as_deref().is_some_and(|s| !s.is_empty());
        if has_token == has_key {
            return Err(ConfigValidationError::CredentialAmbiguous {
                name: self.name.clone(),
            });
        }
        match url::Url::parse(&self.base_url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            _ => {
                return Err(ConfigValidationError::BadBaseUrl {
                    name: self.name.clone(),
                    url: self.base_url.clone(),
                })
            }
        }
        Ok(())
    }

    /// Effective RPM admission cap: `floor(rpm_limit * 0.9)`, or `None` for unlimited.
    pub fn effective_rpm(&self) -> Option<u32> {
        match self.rpm_limit {
            None | Some(0) => None,
            Some(n) => Some(((n as f64) * 0.9).floor() as u32),
        }
    }
}

/// Per-family map of configs, keyed by unique name. This is the shape of
/// `claude.json` / `codex.json` / `legacy.json`.
pub type UpstreamConfigSet = HashMap<String, UpstreamConfig>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    Default,
    ModelMapping,
    ConfigMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSourceType {
    Model,
    Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub source: String,
    pub target: String,
    pub source_type: MappingSourceType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMapping {
    pub model: String,
    pub config: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default = "default_route_mode")]
    pub mode: RouteMode,
    #[serde(default)]
    pub model_mappings: HashMap<Family, Vec<ModelMapping>>,
    #[serde(default)]
    pub config_mappings: HashMap<Family, Vec<ConfigMapping>>,
}

fn default_route_mode() -> RouteMode {
    RouteMode::Default
}

impl Default for RouteMode {
    fn default() -> Self {
        RouteMode::Default
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbMode {
    ActiveFirst,
    WeightBased,
}

impl Default for LbMode {
    fn default() -> Self {
        LbMode::ActiveFirst
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePolicy {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub current_failures: HashMap<String, u32>,
    #[serde(default)]
    pub excluded_configs: Vec<String>,
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            current_failures: HashMap::new(),
            excluded_configs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancePolicy {
    #[serde(default)]
    pub mode: LbMode,
    #[serde(default)]
    pub services: HashMap<Family, ServicePolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Replace,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub source: String,
    pub op: FilterOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Codex reasoning defaults, keyed by model id (spec §6 `data/system.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default = "default_log_limit")]
    pub log_limit: usize,
    #[serde(default)]
    pub effort_by_model: HashMap<String, String>,
    #[serde(default)]
    pub verbosity_by_model: HashMap<String, String>,
    #[serde(default)]
    pub summary_by_model: HashMap<String, String>,
}

fn default_log_limit() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_config_round_trips_unknown_fields() {
        let raw = serde_json::json!({
            "name": "primary",
            "base_url": "https://example.com",
            "api_key": "sk-1",
            "active": true,
            "weight": 0,
            "some_future_field": "kept"
        });
        let parsed: UpstreamConfig = serde_json::from_value(raw.clone()).unwrap();
        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(reserialized["some_future_field"], "kept");
        assert_eq!(reserialized["name"], "primary");
    }

    #[test]
    fn validate_rejects_both_credentials() {
        let cfg = UpstreamConfig {
            name: "x".into(),
            base_url: "https://example.com".into(),
            auth_token: Some("t".into()),
            api_key: Some("k".into()),
            active: false,
            weight: 0,
            rpm_limit: None,
            streaming: None,
            extra: Default::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_neither_credential() {
        let cfg = UpstreamConfig {
            name: "x".into(),
            base_url: "https://example.com".into(),
            auth_token: None,
            api_key: None,
            active: false,
            weight: 0,
            rpm_limit: None,
            streaming: None,
            extra: Default::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn effective_rpm_applies_ten_percent_margin() {
        let mut cfg = UpstreamConfig {
            name: "x".into(),
            base_url: "https://example.com".into(),
            auth_token: Some("t".into()),
            api_key: None,
            active: false,
            weight: 0,
            rpm_limit: Some(10),
            streaming: None,
            extra: Default::default(),
        };
        assert_eq!(cfg.effective_rpm(), Some(9));
        cfg.rpm_limit = Some(0);
        assert_eq!(cfg.effective_rpm(), None);
        cfg.rpm_limit = None;
        assert_eq!(cfg.effective_rpm(), None);
    }
}
