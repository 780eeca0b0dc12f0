//! `FamilyAdapter` — the per-family slice of Transform (spec §4.5 step 2):
//! path normalization, model rewriting, and body backfill. Each adapter
//! knows its canonical route, its alternate routes, and how to reshape an
//! incoming body/headers before the pipeline forwards it.

mod claude;
mod codex;
mod legacy;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use legacy::LegacyAdapter;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::{Family, ModelMapping, SharedConfigStore, UpstreamConfig};

/// Outcome of adapting one request body for forwarding.
pub struct Adapted {
    pub body: Value,
    pub model_final: String,
    /// Whether streaming must be forced off upstream even though the client
    /// asked for `stream=true` (Legacy + tools, spec §4.6b).
    pub force_stream_off: bool,
    /// The actual `stream` value sent to the upstream in `body` — not
    /// necessarily the same as the client's request (Codex always forces
    /// this `true`; Legacy forces it `false` when `force_stream_off`). The
    /// pipeline uses this, not a generic re-derivation, to decide whether to
    /// send the streaming-mode headers upstream (spec §8 scenario 4).
    pub upstream_stream: bool,
}

pub trait FamilyAdapter: Send + Sync {
    fn family(&self) -> Family;

    /// Canonical route path, e.g. `/v1/messages`.
    fn canonical_path(&self) -> &'static str;

    /// Alternate route paths that should be normalized to the canonical one
    /// before adapting (spec §6 HTTP surface table).
    fn alternate_paths(&self) -> &'static [&'static str];

    /// Reshape the incoming body: apply model mapping, inject/prune
    /// family-specific fields, decide whether streaming must be synthesized.
    fn adapt_body(&self, body: Value, model_final: String, client_wants_stream: bool) -> Adapted;

    /// Reshape a body that arrived on one of `alternate_paths()` into this
    /// family's native shape, before `adapt_body` runs (spec §4.5 step 2,
    /// "Path normalization... adapt body shape via FamilyAdapter"). A no-op
    /// for adapters with no alternate path.
    fn convert_alternate_body(&self, body: Value) -> Value {
        body
    }

    /// Mutate outgoing headers for the chosen upstream credential and
    /// streaming mode (spec §4.5 step 5).
    fn adapt_headers(&self, headers: &mut HeaderMap, config: &UpstreamConfig, streaming: bool);
}

/// Current model-mapping list for `family`, read fresh from the
/// `ConfigStore` snapshot on every call (an `Arc` clone, same cost as
/// `UpstreamPool::select`'s own `self.config.routing()` read) so a
/// `routing.json` edit picked up by the config watcher takes effect on the
/// very next request — no adapter rebuild or process restart needed.
pub fn current_model_mappings(config: &SharedConfigStore, family: Family) -> Vec<ModelMapping> {
    config.routing().model_mappings.get(&family).cloned().unwrap_or_default()
}

/// Apply RouteTable model-mapping entries whose `source` matches the
/// incoming model; first match wins (spec §4.5 step 2, "Model rewriting").
pub fn rewrite_model(model: &str, mappings: &[ModelMapping]) -> String {
    mappings
        .iter()
        .find(|m| m.source == model)
        .map(|m| m.target.clone())
        .unwrap_or_else(|| model.to_string())
}

/// `user_<hex>_cli_proxy_account__session_<hex>` (spec §4.5 step 2, Claude backfill).
pub fn stable_user_id() -> String {
    format!(
        "user_{}_cli_proxy_account__session_{}",
        hex_token(8),
        hex_token(8)
    )
}

fn hex_token(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn set_credential_headers(headers: &mut HeaderMap, config: &UpstreamConfig) {
    use reqwest::header::{HeaderValue, AUTHORIZATION};

    if let Some(token) = config.auth_token.as_deref().filter(|s| !s.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
    } else if let Some(key) = config.api_key.as_deref().filter(|s| !s.is_empty()) {
        headers.remove(AUTHORIZATION);
        if let Ok(value) = HeaderValue::from_str(key) {
            headers.insert("x-api-key", value);
        }
    }
}

pub fn set_streaming_headers(headers: &mut HeaderMap, streaming: bool) {
    use reqwest::header::HeaderValue;
    if streaming {
        headers.insert("accept-encoding", HeaderValue::from_static("identity"));
    }
}
