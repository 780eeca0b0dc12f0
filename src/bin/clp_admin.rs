//! Operator CLI for out-of-band maintenance: clearing a failure exclusion or
//! wiping a family's request log, without going through the HTTP surface.
//!
//! No argument-parsing crate — matches the teacher's own binaries, which
//! read configuration from the environment rather than flags; this tool's
//! surface is small enough that hand-rolled `std::env::args()` matching
//! reads more plainly than a derive macro would.

use std::sync::Arc;

use clp::config::{self, ConfigStore, Family};
use clp::log::RequestLog;
use clp::upstream::UpstreamPool;

fn parse_family(s: &str) -> Option<Family> {
    match s {
        "claude" => Some(Family::Claude),
        "codex" => Some(Family::Codex),
        "legacy" => Some(Family::Legacy),
        _ => None,
    }
}

fn usage() -> ! {
    eprintln!(
        "usage:\n  clp-admin reset-failures <claude|codex|legacy> <config-name>\n  clp-admin clear-log <claude|codex|legacy>"
    );
    std::process::exit(2)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "clp=info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Arc::new(ConfigStore::load(config::default_root())?);

    match args.as_slice() {
        [cmd, family_arg, name] if cmd == "reset-failures" => {
            let Some(family) = parse_family(family_arg) else { usage() };
            let pool = UpstreamPool::new(config);
            pool.reset_failures(family, name).await?;
            println!("cleared failure count and exclusion for {family_arg}/{name}");
        }
        [cmd, family_arg] if cmd == "clear-log" => {
            let Some(family) = parse_family(family_arg) else { usage() };
            let log = RequestLog::new(config.root(), family, config.system().log_limit);
            log.clear().await;
            println!("cleared request log for {family_arg}");
        }
        _ => usage(),
    }

    Ok(())
}
