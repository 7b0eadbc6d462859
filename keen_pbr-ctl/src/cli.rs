use clap::{Parser, Subcommand};

use std::path::PathBuf;

use keen_pbr_lib::command::Command;
use keen_pbr_lib::socket;

/// Control CLI for the keen_pbr system service
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Socket path for communication with the service
    #[arg(
        short,
        long,
        env = socket::ENV_VAR,
        default_value = socket::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// Print raw JSON responses
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum CtlCommand {
    /// Check that the service is alive
    Ping,
    /// Show reconciler state per ipset
    Status,
    /// Run one reconciliation pass now
    Apply,
    /// Fetch remote lists into the cache directory
    Download,
    /// Restart the reconciler (flushes sets, reapplies, reloads the resolver)
    Restart,
    /// Toggle the kill switch of one ipset group and restart the service
    SetKillSwitch {
        /// Name of the ipset group
        ipset: String,
        /// true drops matched traffic when no interface is up, false lets it
        /// fall back to the default route
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl From<CtlCommand> for Command {
    fn from(cmd: CtlCommand) -> Self {
        match cmd {
            CtlCommand::Ping => Command::Ping,
            CtlCommand::Status => Command::Status,
            CtlCommand::Apply => Command::Apply,
            CtlCommand::Download => Command::Download,
            CtlCommand::Restart => Command::Restart,
            CtlCommand::SetKillSwitch { ipset, enabled } => Command::SetKillSwitch { ipset, enabled },
        }
    }
}
