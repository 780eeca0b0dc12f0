//! `UpstreamPool` — per-family upstream selection plus failure accounting
//! (spec §4.4).
//!
//! Selection and failure-tracker updates both read/write the same
//! `LoadBalancePolicy` document in the `ConfigStore`, serialized per family
//! exactly the way `provider_health.rs`'s `ProviderHealthTracker` serializes
//! health updates behind a single `RwLock` — except here the authoritative
//! state is the persisted document itself (spec §9 design note: "operator-
//! visible counts match what the pool uses").

use std::collections::HashSet;

use rand::Rng;
use tokio::sync::{broadcast, Mutex};

use crate::config::{Family, LbMode, LoadBalancePolicy, RouteMode, ServicePolicy, SharedConfigStore, UpstreamConfig};
use crate::error::PipelineError;

#[derive(Debug, Clone)]
pub struct Selected {
    pub config: UpstreamConfig,
}

/// Broadcast to interested observers (the realtime `/ws/realtime` fan-out)
/// when a config crosses the failure threshold and is excluded.
#[derive(Debug, Clone)]
pub struct ConfigExcluded {
    pub family: Family,
    pub name: String,
}

pub struct UpstreamPool {
    config: SharedConfigStore,
    /// Serializes selection + failure-tracker read-modify-write per family,
    /// so two concurrent failures don't race on the same `currentFailures`
    /// counter (spec §5: "serialized per family to keep eviction decisions
    /// consistent").
    locks: [Mutex<()>; 3],
    events: broadcast::Sender<ConfigExcluded>,
}

fn family_index(family: Family) -> usize {
    match family {
        Family::Claude => 0,
        Family::Codex => 1,
        Family::Legacy => 2,
    }
}

impl UpstreamPool {
    pub fn new(config: SharedConfigStore) -> Self {
        let (events, _rx) = broadcast::channel(64);
        Self {
            config,
            locks: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
            events,
        }
    }

    pub fn subscribe_exclusions(&self) -> broadcast::Receiver<ConfigExcluded> {
        self.events.subscribe()
    }

    /// Selection protocol (spec §4.4 steps 1-4). Returns the chosen
    /// upstream config, or a `PipelineError` matching the spec's error
    /// table (`ERR_NO_ACTIVE` / `ERR_UPSTREAM_UNAVAIL`).
    pub async fn select(&self, family: Family, requested_model: &str) -> Result<Selected, PipelineError> {
        let _guard = self.locks[family_index(family)].lock().await;

        let configs = self.config.configs(family);
        let policy = self.config.loadbalance();
        let service = policy.services.get(&family).cloned().unwrap_or_default();
        let excluded: HashSet<&str> = service.excluded_configs.iter().map(|s| s.as_str()).collect();

        let routing = self.config.routing();
        let restrict_to: Option<&str> = if routing.mode == RouteMode::ConfigMapping {
            routing
                .config_mappings
                .get(&family)
                .and_then(|mappings| mappings.iter().find(|m| m.model == requested_model))
                .map(|m| m.config.as_str())
        } else {
            None
        };

        let eligible: Vec<&UpstreamConfig> = if let Some(name) = restrict_to {
            if excluded.contains(name) {
                return Err(PipelineError::UpstreamUnavailable);
            }
            configs.get(name).into_iter().collect()
        } else {
            configs
                .values()
                .filter(|c| !excluded.contains(c.name.as_str()))
                .collect()
        };

        match policy.mode {
            LbMode::ActiveFirst => {
                let actives: Vec<&&UpstreamConfig> = eligible.iter().filter(|c| c.active).collect();
                match actives.as_slice() {
                    [only] => Ok(Selected {
                        config: (**only).clone(),
                    }),
                    _ => Err(PipelineError::NoActiveUpstream),
                }
            }
            LbMode::WeightBased => {
                if eligible.is_empty() {
                    return Err(PipelineError::UpstreamUnavailable);
                }
                let all_zero = eligible.iter().all(|c| c.weight == 0);
                let weighted: Vec<(&UpstreamConfig, u32)> = if all_zero {
                    eligible.iter().map(|c| (*c, 1u32)).collect()
                } else {
                    eligible
                        .iter()
                        .filter(|c| c.weight > 0)
                        .map(|c| (*c, c.weight.max(1)))
                        .collect()
                };
                if weighted.is_empty() {
                    return Err(PipelineError::UpstreamUnavailable);
                }
                let total: u32 = weighted.iter().map(|(_, w)| *w).sum();
                let mut pick = rand::thread_rng().gen_range(0..total);
                for (config, weight) in &weighted {
                    if pick < *weight {
                        return Ok(Selected {
                            config: (*config).clone(),
                        });
                    }
                    pick -= weight;
                }
                unreachable!("weighted selection must pick an entry")
            }
        }
    }

    /// Record an upstream failure (5xx or transport error). Increments the
    /// per-config counter and, once it reaches `failureThreshold`, excludes
    /// the config and emits `ConfigExcluded`.
    pub async fn record_failure(&self, family: Family, name: &str) {
        let _guard = self.locks[family_index(family)].lock().await;

        let mut policy = (*self.config.loadbalance()).clone();
        let service = policy.services.entry(family).or_insert_with(ServicePolicy::default);
        let count = service.current_failures.entry(name.to_string()).or_insert(0);
        *count += 1;
        let crossed = *count >= service.failure_threshold
            && !service.excluded_configs.iter().any(|n| n == name);
        if crossed {
            service.excluded_configs.push(name.to_string());
        }

        if let Err(e) = self.config.put_loadbalance(policy).await {
            tracing::error!(error = %e, "failed to persist failure-tracker update");
        }

        if crossed {
            tracing::info!(family = family.as_str(), config = name, "config excluded after crossing failure threshold");
            let _ = self.events.send(ConfigExcluded {
                family,
                name: name.to_string(),
            });
        }
    }

    /// 4xx from upstream does not change the counter (spec §4.4): this is a
    /// no-op kept for call-site symmetry/readability at the pipeline layer.
    pub fn record_client_fault(&self, _family: Family, _name: &str) {}

    /// Operator reset: clear a config's failure count and exclusion.
    pub async fn reset_failures(&self, family: Family, name: &str) -> Result<(), crate::config::ConfigError> {
        let _guard = self.locks[family_index(family)].lock().await;

        let mut policy = (*self.config.loadbalance()).clone();
        if let Some(service) = policy.services.get_mut(&family) {
            service.current_failures.remove(name);
            service.excluded_configs.retain(|n| n != name);
        }
        self.config.put_loadbalance(policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, UpstreamConfigSet};
    use std::sync::Arc;

    async fn store_with(family: Family, configs: Vec<UpstreamConfig>) -> Arc<ConfigStore> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::load(dir.path().to_path_buf()).unwrap());
        let mut set = UpstreamConfigSet::new();
        for c in configs {
            set.insert(c.name.clone(), c);
        }
        store.put_configs(family, set).await.unwrap();
        store
    }

    fn cfg(name: &str, active: bool, weight: u32) -> UpstreamConfig {
        UpstreamConfig {
            name: name.into(),
            base_url: "https://example.com".into(),
            auth_token: Some("t".into()),
            api_key: None,
            active,
            weight,
            rpm_limit: None,
            streaming: None,
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn active_first_with_no_active_after_exclusion_does_not_promote_inactive() {
        let store = store_with(Family::Claude, vec![cfg("a", true, 0), cfg("b", false, 0)]).await;
        let pool = UpstreamPool::new(store.clone());

        let mut policy = LoadBalancePolicy::default();
        policy.mode = LbMode::ActiveFirst;
        let mut service = ServicePolicy::default();
        service.excluded_configs.push("a".to_string());
        policy.services.insert(Family::Claude, service);
        store.put_loadbalance(policy).await.unwrap();

        let result = pool.select(Family::Claude, "any-model").await;
        assert!(matches!(result, Err(PipelineError::NoActiveUpstream)));
    }

    #[tokio::test]
    async fn failure_threshold_excludes_after_n_failures() {
        let store = store_with(
            Family::Codex,
            vec![cfg("c1", false, 10), cfg("c2", false, 10), cfg("c3", false, 10)],
        )
        .await;

        let mut policy = LoadBalancePolicy::default();
        policy.mode = LbMode::WeightBased;
        let mut service = ServicePolicy::default();
        service.failure_threshold = 2;
        policy.services.insert(Family::Codex, service);
        store.put_loadbalance(policy).await.unwrap();

        let pool = UpstreamPool::new(store.clone());
        pool.record_failure(Family::Codex, "c1").await;
        pool.record_failure(Family::Codex, "c1").await;

        let policy = store.loadbalance();
        let service = policy.services.get(&Family::Codex).unwrap();
        assert!(service.excluded_configs.contains(&"c1".to_string()));

        for _ in 0..20 {
            let selected = pool.select(Family::Codex, "m").await.unwrap();
            assert_ne!(selected.config.name, "c1");
        }
    }

    #[tokio::test]
    async fn config_mapping_restricts_to_named_config_and_fails_if_excluded() {
        let store = store_with(Family::Claude, vec![cfg("a", true, 0), cfg("b", true, 0)]).await;
        let mut routing = crate::config::RouteTable::default();
        routing.mode = RouteMode::ConfigMapping;
        routing.config_mappings.insert(
            Family::Claude,
            vec![crate::config::ConfigMapping {
                model: "claude-3".into(),
                config: "b".into(),
            }],
        );
        store.put_routing(routing).await.unwrap();

        let mut policy = LoadBalancePolicy::default();
        policy.mode = LbMode::ActiveFirst;
        let mut service = ServicePolicy::default();
        service.excluded_configs.push("b".to_string());
        policy.services.insert(Family::Claude, service);
        store.put_loadbalance(policy).await.unwrap();

        let pool = UpstreamPool::new(store);
        let result = pool.select(Family::Claude, "claude-3").await;
        assert!(matches!(result, Err(PipelineError::UpstreamUnavailable)));
    }
}
