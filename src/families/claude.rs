//! Claude family adapter: Anthropic Messages API (`/v1/messages`).

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use super::{
    current_model_mappings, rewrite_model, set_credential_headers, set_streaming_headers, stable_user_id, Adapted,
    FamilyAdapter,
};
use crate::config::{Family, SharedConfigStore, UpstreamConfig};

pub struct ClaudeAdapter {
    pub config: SharedConfigStore,
}

impl FamilyAdapter for ClaudeAdapter {
    fn family(&self) -> Family {
        Family::Claude
    }

    fn canonical_path(&self) -> &'static str {
        "/v1/messages"
    }

    fn alternate_paths(&self) -> &'static [&'static str] {
        &["/v1/chat/completions"]
    }

    /// A client calling the Chat Completions shape on the Claude port sends
    /// OpenAI-style `messages: [{role, content}]` with system prompts inline
    /// as `role: "system"` entries and tools as `{type: "function", function}`.
    /// Anthropic wants system prompts pulled into a top-level `system`
    /// string and tools as `{name, description, input_schema}` (spec §4.5
    /// step 2, "Path normalization... adapt body shape").
    fn convert_alternate_body(&self, body: Value) -> Value {
        let Some(obj) = body.as_object() else { return body };

        let messages = obj.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();

        let system: Vec<String> = messages
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) == Some("system"))
            .filter_map(|m| m.get("content").and_then(Value::as_str).map(str::to_string))
            .collect();

        let anthropic_messages: Vec<Value> = messages
            .iter()
            .filter(|m| m.get("role").and_then(Value::as_str) != Some("system"))
            .map(|m| {
                let role = match m.get("role").and_then(Value::as_str) {
                    Some("assistant") => "assistant",
                    _ => "user",
                };
                let content = m.get("content").cloned().unwrap_or(json!(""));
                json!({ "role": role, "content": content })
            })
            .collect();

        let mut converted = serde_json::Map::new();
        if let Some(model) = obj.get("model") {
            converted.insert("model".to_string(), model.clone());
        }
        if let Some(max_tokens) = obj.get("max_tokens") {
            converted.insert("max_tokens".to_string(), max_tokens.clone());
        } else {
            converted.insert("max_tokens".to_string(), json!(4096));
        }
        if !system.is_empty() {
            converted.insert("system".to_string(), json!(system.join("\n")));
        }
        converted.insert("messages".to_string(), json!(anthropic_messages));

        if let Some(tools) = obj.get("tools").and_then(Value::as_array) {
            let mapped: Vec<Value> = tools
                .iter()
                .filter_map(|t| t.get("function"))
                .map(|f| {
                    json!({
                        "name": f.get("name").cloned().unwrap_or(json!("")),
                        "description": f.get("description").cloned().unwrap_or(json!("")),
                        "input_schema": f.get("parameters").cloned().unwrap_or(json!({})),
                    })
                })
                .collect();
            converted.insert("tools".to_string(), json!(mapped));
        }

        Value::Object(converted)
    }

    fn adapt_body(&self, mut body: Value, model: String, client_wants_stream: bool) -> Adapted {
        let mappings = current_model_mappings(&self.config, Family::Claude);
        let model_final = rewrite_model(&model, &mappings);
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), json!(model_final));
            obj.insert("stream".to_string(), json!(client_wants_stream));

            let needs_user_id = obj
                .get("metadata")
                .and_then(|m| m.get("user_id"))
                .map(|v| v.as_str().unwrap_or("").is_empty())
                .unwrap_or(true);
            if needs_user_id {
                let metadata = obj.entry("metadata").or_insert_with(|| json!({}));
                if let Some(m) = metadata.as_object_mut() {
                    m.insert("user_id".to_string(), json!(stable_user_id()));
                }
            }
        }
        Adapted {
            body,
            model_final,
            force_stream_off: false,
            upstream_stream: client_wants_stream,
        }
    }

    fn adapt_headers(&self, headers: &mut HeaderMap, config: &UpstreamConfig, streaming: bool) {
        set_credential_headers(headers, config);
        // When an api_key (x-api-key) is configured, any inbound Authorization
        // header must be dropped — Anthropic rejects requests carrying both
        // (spec §4.5 step 2).
        if config.api_key.as_deref().filter(|s| !s.is_empty()).is_some() {
            headers.remove(reqwest::header::AUTHORIZATION);
        }
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(
            "x-stainless-lang",
            HeaderValue::from_static("js"),
        );
        headers.insert("x-stainless-runtime", HeaderValue::from_static("node"));
        set_streaming_headers(headers, streaming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, MappingSourceType, ModelMapping, RouteTable};

    async fn adapter_with(mappings: Vec<ModelMapping>) -> ClaudeAdapter {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedConfigStore = std::sync::Arc::new(ConfigStore::load(dir.path().to_path_buf()).unwrap());
        let mut routing = RouteTable::default();
        routing.model_mappings.insert(Family::Claude, mappings);
        store.put_routing(routing).await.unwrap();
        ClaudeAdapter { config: store }
    }

    #[tokio::test]
    async fn converts_chat_completions_shape_to_anthropic_messages() {
        let adapter = adapter_with(vec![]).await;
        let body = json!({
            "model": "claude-3",
            "messages": [
                {"role": "system", "content": "be concise"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
            ],
            "tools": [{"type": "function", "function": {"name": "f", "description": "d", "parameters": {}}}],
        });
        let converted = adapter.convert_alternate_body(body);
        assert_eq!(converted["system"], "be concise");
        assert_eq!(converted["messages"].as_array().unwrap().len(), 2);
        assert_eq!(converted["messages"][0]["role"], "user");
        assert_eq!(converted["messages"][1]["role"], "assistant");
        assert_eq!(converted["tools"][0]["name"], "f");
        assert_eq!(converted["tools"][0]["input_schema"], json!({}));
    }

    #[tokio::test]
    async fn injects_user_id_when_absent() {
        let adapter = adapter_with(vec![]).await;
        let adapted = adapter.adapt_body(json!({"messages": []}), "claude-3-opus".into(), true);
        let user_id = adapted.body["metadata"]["user_id"].as_str().unwrap().to_string();
        assert!(user_id.starts_with("user_"));
        assert!(user_id.contains("_cli_proxy_account__session_"));
        assert!(adapted.upstream_stream);
    }

    #[tokio::test]
    async fn leaves_existing_user_id_untouched() {
        let adapter = adapter_with(vec![]).await;
        let body = json!({"metadata": {"user_id": "user_existing"}});
        let adapted = adapter.adapt_body(body, "claude-3".into(), false);
        assert_eq!(adapted.body["metadata"]["user_id"], "user_existing");
        assert!(!adapted.upstream_stream);
    }

    #[tokio::test]
    async fn rewrites_model_when_mapping_matches() {
        let adapter = adapter_with(vec![ModelMapping {
            source: "claude-3".into(),
            target: "claude-3-opus-20240229".into(),
            source_type: MappingSourceType::Model,
        }])
        .await;
        let adapted = adapter.adapt_body(json!({}), "claude-3".into(), true);
        assert_eq!(adapted.model_final, "claude-3-opus-20240229");
        assert_eq!(adapted.body["model"], "claude-3-opus-20240229");
    }

    #[tokio::test]
    async fn credential_headers_drop_authorization_when_api_key_present() {
        let adapter = adapter_with(vec![]).await;
        let config = UpstreamConfig {
            name: "a".into(),
            base_url: "https://example.com".into(),
            auth_token: None,
            api_key: Some("key-1".into()),
            active: true,
            weight: 0,
            rpm_limit: None,
            streaming: None,
            extra: Default::default(),
        };
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        adapter.adapt_headers(&mut headers, &config, false);
        assert!(!headers.contains_key(reqwest::header::AUTHORIZATION));
        assert_eq!(headers.get("x-api-key").unwrap(), "key-1");
    }
}
