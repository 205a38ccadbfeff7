//! Node configuration: schema and loading.

mod load;
mod schema;

pub use load::{apply_env_overrides, default_config_path, load, load_or_init, write_config};
pub use schema::{
    Config, ConflictResolution, FilesystemConfig, LoggingConfig, NetworkConfig, NodeConfig,
    SyncConfig,
};
