use exitcode::{self, ExitCode};

use std::process;

use keen_pbr_lib::command::{Command, Response};
use keen_pbr_lib::lists::DownloadStatus;
use keen_pbr_lib::reconciler::{ApplyReport, IpsetState};
use keen_pbr_lib::socket;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// apply exit code for "configuration valid but no interface up and no kill switch"
const EXIT_NO_INTERFACE: ExitCode = 5;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let cmd: Command = args.command.into();
    let resp = match socket::process_cmd(&args.socket_path, &cmd).await {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("Error processing {cmd}: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if args.json {
        json_print(&resp)
    } else {
        pretty_print(&resp)
    };

    let exit = determine_exitcode(&resp);
    process::exit(exit);
}

fn json_print(resp: &Response) {
    match serde_json::to_string_pretty(resp) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn pretty_print(resp: &Response) {
    match resp {
        Response::Pong => {
            println!("Pong");
        }
        Response::Status(status) => {
            println!("Reconciler: {}", if status.running { "running" } else { "stopped" });
            for ipset in &status.ipsets {
                println!("---");
                println!("{}: {}", ipset.name, describe_state(&ipset.state));
            }
        }
        Response::Apply(ApplyReport::Applied(statuses)) => {
            println!("Applied:");
            for ipset in statuses {
                println!("  {}: {}", ipset.name, describe_state(&ipset.state));
            }
        }
        Response::Apply(ApplyReport::NoInterface) => {
            eprintln!("Nothing applied: no interface up and no kill switch configured");
        }
        Response::Download(outcomes) => {
            for outcome in outcomes {
                match &outcome.status {
                    DownloadStatus::Downloaded => println!("{}: downloaded", outcome.list_name),
                    DownloadStatus::Unchanged => println!("{}: unchanged", outcome.list_name),
                    DownloadStatus::Failed(e) => eprintln!("{}: failed ({e})", outcome.list_name),
                }
            }
        }
        Response::Restarted => {
            println!("Restarted");
        }
        Response::Updated => {
            println!("Configuration updated and reapplied");
        }
        Response::Error(e) => {
            eprintln!("Error: {e}");
        }
    }
}

fn describe_state(state: &IpsetState) -> String {
    match state {
        IpsetState::Routed { interface } => format!("routed via {interface}"),
        IpsetState::Blackhole => "blackhole (kill switch)".to_string(),
        IpsetState::Idle => "idle (no interface up)".to_string(),
        IpsetState::Failed { error } => format!("failed: {error}"),
    }
}

fn determine_exitcode(resp: &Response) -> ExitCode {
    match resp {
        Response::Pong => exitcode::OK,
        Response::Status(..) => exitcode::OK,
        Response::Apply(ApplyReport::Applied(..)) => exitcode::OK,
        Response::Apply(ApplyReport::NoInterface) => EXIT_NO_INTERFACE,
        Response::Download(outcomes) => {
            if outcomes.iter().any(|o| matches!(o.status, DownloadStatus::Failed(_))) {
                exitcode::TEMPFAIL
            } else {
                exitcode::OK
            }
        }
        Response::Restarted => exitcode::OK,
        Response::Updated => exitcode::OK,
        Response::Error(..) => exitcode::SOFTWARE,
    }
}
