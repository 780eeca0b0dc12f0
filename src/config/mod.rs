//! ConfigStore: loads and watches the JSON documents under `~/.clp/`,
//! exposes get/put/subscribe, and hot-reloads on external edits.

mod model;
mod store;
mod watch;

pub use model::{
    ConfigMapping, ConfigValidationError, Family, FilterOp, FilterRule, LbMode, LoadBalancePolicy,
    MappingSourceType, ModelMapping, RouteMode, RouteTable, ServicePolicy, StreamingMode,
    SystemSettings, UpstreamConfig, UpstreamConfigSet,
};
pub use store::{ConfigDoc, ConfigError, ConfigStore, SharedConfigStore};
pub use watch::{spawn_watcher, WatcherGuard};

/// Default config root: `~/.clp`.
pub fn default_root() -> std::path::PathBuf {
    dirs_home().join(".clp")
}

fn dirs_home() -> std::path::PathBuf {
    std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}
