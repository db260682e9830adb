//! CLI command implementations

mod config;
mod fleet;

pub use config::{config_file, config_init, config_path, config_show, load};
pub use fleet::{
    connect, deploy_command, deps_command, enable_command, lifecycle_command, run_command,
    DeployPlan, Reporter, TargetArgs,
};
