use clap::Parser;

use std::path::PathBuf;

use keen_pbr_lib::{config, socket};

pub const ENV_VAR_LOG_FILE: &str = "KEEN_PBR_LOG_FILE";

/// keen_pbr system service - policy based routing controller for Keenetic routers
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path for communication with this service
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// General configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
        )]
    pub config_path: PathBuf,

    /// Log to this file instead of stdout
    #[arg(long, env = ENV_VAR_LOG_FILE, default_value = None)]
    pub log_file: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
