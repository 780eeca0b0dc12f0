//! Codex family adapter: OpenAI Responses API (`/v1/responses`).

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use super::{current_model_mappings, rewrite_model, set_credential_headers, set_streaming_headers, Adapted, FamilyAdapter};
use crate::config::{Family, SharedConfigStore, UpstreamConfig};

pub struct CodexAdapter {
    pub config: SharedConfigStore,
}

/// Fields Codex upstreams are known to reject (spec §4.5 step 2).
const PRUNED_FIELDS: &[&str] = &["max_output_tokens", "service_tier"];

impl FamilyAdapter for CodexAdapter {
    fn family(&self) -> Family {
        Family::Codex
    }

    fn canonical_path(&self) -> &'static str {
        "/v1/responses"
    }

    fn alternate_paths(&self) -> &'static [&'static str] {
        &[]
    }

    fn adapt_body(&self, mut body: Value, model: String, _client_wants_stream: bool) -> Adapted {
        let mappings = current_model_mappings(&self.config, Family::Codex);
        let system = self.config.system();
        let model_final = rewrite_model(&model, &mappings);
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), json!(model_final));
            obj.insert("store".to_string(), json!(false));
            obj.insert("stream".to_string(), json!(true));

            for field in PRUNED_FIELDS {
                obj.remove(*field);
            }

            if !obj.contains_key("instructions") {
                obj.insert("instructions".to_string(), json!(""));
            }

            if let Some(effort) = system.effort_by_model.get(&model_final) {
                let reasoning = obj.entry("reasoning").or_insert_with(|| json!({}));
                if let Some(r) = reasoning.as_object_mut() {
                    r.entry("effort").or_insert_with(|| json!(effort));
                }
            }
            if let Some(summary) = system.summary_by_model.get(&model_final) {
                let reasoning = obj.entry("reasoning").or_insert_with(|| json!({}));
                if let Some(r) = reasoning.as_object_mut() {
                    r.entry("summary").or_insert_with(|| json!(summary));
                }
            }
            if let Some(verbosity) = system.verbosity_by_model.get(&model_final) {
                obj.entry("text").or_insert_with(|| json!({}));
                if let Some(t) = obj.get_mut("text").and_then(Value::as_object_mut) {
                    t.entry("verbosity").or_insert_with(|| json!(verbosity));
                }
            }
        }

        // Codex always forces stream=true upstream (spec §4.5 step 2), so
        // there is nothing to synthesize — the client's own request is what
        // decides whether *we* re-stream or buffer on the way back out.
        Adapted {
            body,
            model_final,
            force_stream_off: false,
            upstream_stream: true,
        }
    }

    fn adapt_headers(&self, headers: &mut HeaderMap, config: &UpstreamConfig, streaming: bool) {
        set_credential_headers(headers, config);
        headers.insert("openai-beta", HeaderValue::from_static("responses=experimental"));
        if streaming {
            headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        set_streaming_headers(headers, streaming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, SystemSettings};
    use std::collections::HashMap;

    async fn adapter() -> CodexAdapter {
        adapter_with_system(SystemSettings::default()).await
    }

    async fn adapter_with_system(system: SystemSettings) -> CodexAdapter {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedConfigStore = std::sync::Arc::new(ConfigStore::load(dir.path().to_path_buf()).unwrap());
        store.put_system(system).await.unwrap();
        CodexAdapter { config: store }
    }

    #[tokio::test]
    async fn forces_store_false_and_stream_true() {
        let adapted = adapter().await.adapt_body(json!({"max_output_tokens": 100}), "o4-mini".into(), false);
        assert_eq!(adapted.body["store"], false);
        assert_eq!(adapted.body["stream"], true);
        assert!(adapted.body.get("max_output_tokens").is_none());
        assert!(adapted.upstream_stream);
    }

    #[tokio::test]
    async fn injects_instructions_when_absent() {
        let adapted = adapter().await.adapt_body(json!({}), "o4-mini".into(), true);
        assert!(adapted.body.get("instructions").is_some());
    }

    #[tokio::test]
    async fn applies_effort_default_from_system_settings() {
        let mut system = SystemSettings::default();
        system.effort_by_model = HashMap::from([("o4-mini".to_string(), "high".to_string())]);
        let adapter = adapter_with_system(system).await;
        let adapted = adapter.adapt_body(json!({}), "o4-mini".into(), true);
        assert_eq!(adapted.body["reasoning"]["effort"], "high");
    }
}
