//! Legacy family entry point — OpenAI Chat Completions API on `127.0.0.1:3212`.

use std::sync::Arc;

use clp::app::{build_router, AppState};
use clp::config::{self, ConfigStore, Family};
use clp::families::LegacyAdapter;
use clp::log::RequestLog;
use clp::pipeline::{Pipeline, CONNECT_TIMEOUT};
use clp::rate_limit::RateLimiterRegistry;
use clp::upstream::UpstreamPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "clp=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let family = Family::Legacy;
    let root = config::default_root();
    let config = Arc::new(ConfigStore::load(root)?);
    let _watcher = config::spawn_watcher(config.clone());

    let http = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

    let log = RequestLog::new(config.root(), family, config.system().log_limit);
    let pipeline = Pipeline {
        family,
        config: config.clone(),
        upstream: Arc::new(UpstreamPool::new(config.clone())),
        rate_limiters: Arc::new(RateLimiterRegistry::new()),
        log: log.clone(),
        http,
        adapter: Box::new(LegacyAdapter { config: config.clone() }),
    };

    let state = Arc::new(AppState {
        family,
        config,
        log,
        pipeline,
    });
    let router = build_router(state);

    let addr = format!("127.0.0.1:{}", family.port());
    tracing::info!(%addr, "starting clp-legacy");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
