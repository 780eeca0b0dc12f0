//! Legacy family adapter: OpenAI Chat Completions API (`/v1/chat/completions`).

use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::{current_model_mappings, rewrite_model, set_credential_headers, set_streaming_headers, Adapted, FamilyAdapter};
use crate::config::{Family, SharedConfigStore, UpstreamConfig};

pub struct LegacyAdapter {
    pub config: SharedConfigStore,
}

impl FamilyAdapter for LegacyAdapter {
    fn family(&self) -> Family {
        Family::Legacy
    }

    fn canonical_path(&self) -> &'static str {
        "/v1/chat/completions"
    }

    fn alternate_paths(&self) -> &'static [&'static str] {
        &[]
    }

    fn adapt_body(&self, mut body: Value, model: String, client_wants_stream: bool) -> Adapted {
        let mappings = current_model_mappings(&self.config, Family::Legacy);
        let model_final = rewrite_model(&model, &mappings);
        // Some upstreams reject `stream=true` combined with `tools`; when
        // that's the case we force stream off upstream and synthesize SSE
        // back to the client from the buffered JSON (spec §4.6b).
        let has_tools = body
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|t| !t.is_empty());
        let force_stream_off = client_wants_stream && has_tools;
        let upstream_stream = client_wants_stream && !force_stream_off;

        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), json!(model_final));
            obj.insert("stream".to_string(), json!(upstream_stream));
        }

        Adapted {
            body,
            model_final,
            force_stream_off,
            upstream_stream,
        }
    }

    fn adapt_headers(&self, headers: &mut HeaderMap, config: &UpstreamConfig, streaming: bool) {
        set_credential_headers(headers, config);
        set_streaming_headers(headers, streaming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    async fn adapter() -> LegacyAdapter {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedConfigStore = std::sync::Arc::new(ConfigStore::load(dir.path().to_path_buf()).unwrap());
        LegacyAdapter { config: store }
    }

    #[tokio::test]
    async fn forces_stream_off_when_tools_present_and_client_wants_stream() {
        let adapter = adapter().await;
        let body = json!({"tools": [{"type": "function", "function": {"name": "f"}}]});
        let adapted = adapter.adapt_body(body, "gpt-4".into(), true);
        assert!(adapted.force_stream_off);
        assert_eq!(adapted.body["stream"], false);
        assert!(!adapted.upstream_stream);
    }

    #[tokio::test]
    async fn streams_upstream_when_no_tools() {
        let adapter = adapter().await;
        let adapted = adapter.adapt_body(json!({}), "gpt-4".into(), true);
        assert!(!adapted.force_stream_off);
        assert_eq!(adapted.body["stream"], true);
        assert!(adapted.upstream_stream);
    }
}
