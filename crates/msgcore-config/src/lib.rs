//! Configuration loading: discovery across TOML/YAML/JSON, `${ENV_VAR}`
//! substitution, and a test-only directory override — one schema per
//! component (gateway, logic, task, repo, bus, sessions, store).

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use loader::{
    clear_config_dir, config_dir, data_dir, discover_and_load, find_or_default_config_path, load_config, load_config_value, save_config,
    set_config_dir, update_config,
};
pub use schema::{BusConfig, GatewayConfig, LogicConfig, MsgcoreConfig, RepoConfig, SessionsConfig, StoreConfig, TaskConfig};
