use serde::{Deserialize, Serialize};

use std::fmt::{self, Display};

use crate::lists::DownloadOutcome;
use crate::reconciler::{ApplyReport, Status};

/// Commands accepted by the daemon over its unix socket.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Command {
    Ping,
    Status,
    Apply,
    Download,
    Restart,
    /// persisted configuration change, followed by the restart sequence
    SetKillSwitch { ipset: String, enabled: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Status(Status),
    Apply(ApplyReport),
    Download(Vec<DownloadOutcome>),
    Restarted,
    Updated,
    Error(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Ping => write!(f, "ping"),
            Command::Status => write!(f, "status"),
            Command::Apply => write!(f, "apply"),
            Command::Download => write!(f, "download"),
            Command::Restart => write!(f, "restart"),
            Command::SetKillSwitch { ipset, enabled } => write!(f, "set-kill-switch {ipset} {enabled}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_through_json() -> anyhow::Result<()> {
        for cmd in [
            Command::Ping,
            Command::Status,
            Command::Apply,
            Command::Download,
            Command::Restart,
            Command::SetKillSwitch {
                ipset: "vpn".to_string(),
                enabled: true,
            },
        ] {
            let json = serde_json::to_string(&cmd)?;
            let parsed: Command = serde_json::from_str(&json)?;
            assert_eq!(parsed, cmd);
        }
        Ok(())
    }
}
