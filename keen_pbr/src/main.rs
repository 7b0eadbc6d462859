use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use keen_pbr_lib::command::{Command, Response};
use keen_pbr_lib::config;
use keen_pbr_lib::logging::{self, LogReloadHandle};
use keen_pbr_lib::reconciler::{self, RealSupervisor};
use keen_pbr_lib::socket;

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

enum SignalMessage {
    Shutdown,
    RotateLogs,
}

async fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
    let (sender, receiver) = mpsc::channel(32);
    let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGINT handler");
        exitcode::IOERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGTERM handler");
        exitcode::IOERR
    })?;
    let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
        tracing::error!(?error, "error setting up SIGHUP handler");
        exitcode::IOERR
    })?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = sigint.recv() => {
                    tracing::debug!("received SIGINT");
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        tracing::warn!("SIGINT: receiver closed");
                        break;
                    }
                },
                Some(_) = sigterm.recv() => {
                    tracing::debug!("received SIGTERM");
                    if sender.send(SignalMessage::Shutdown).await.is_err() {
                        tracing::warn!("SIGTERM: receiver closed");
                        break;
                    }
                },
                Some(_) = sighup.recv() => {
                    tracing::debug!("received SIGHUP");
                    if sender.send(SignalMessage::RotateLogs).await.is_err() {
                        tracing::warn!("SIGHUP: receiver closed");
                        break;
                    }
                }
                else => {
                    tracing::warn!("signal streams closed");
                    break;
                }
            }
        }
    });

    Ok(receiver)
}

async fn socket_listener(socket_path: &Path) -> Result<UnixListener, exitcode::ExitCode> {
    match socket_path.try_exists() {
        Ok(true) => {
            tracing::info!("probing for running instance");
            match socket::process_cmd(socket_path, &Command::Ping).await {
                Ok(_) => {
                    tracing::error!("system service is already running - cannot start another instance");
                    return Err(exitcode::TEMPFAIL);
                }
                Err(e) => {
                    tracing::debug!(warn = ?e, "done probing for running instance");
                }
            };
            fs::remove_file(socket_path).await.map_err(|e| {
                tracing::error!(error = ?e, "error removing stale socket file");
                exitcode::IOERR
            })?;
        }
        Ok(false) => (),
        Err(e) => {
            tracing::error!(error = ?e, "error checking socket path");
            return Err(exitcode::IOERR);
        }
    };

    let socket_dir = socket_path.parent().ok_or_else(|| {
        tracing::error!("socket path has no parent");
        exitcode::UNAVAILABLE
    })?;
    fs::create_dir_all(socket_dir).await.map_err(|e| {
        tracing::error!(error = %e, "error creating socket directory");
        exitcode::IOERR
    })?;

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        tracing::error!(error = ?e, "error binding socket");
        exitcode::OSFILE
    })?;

    // update permissions to allow unprivileged access
    fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "error setting socket permissions");
            exitcode::NOPERM
        })?;

    Ok(listener)
}

async fn daemon(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
    let reload_handle = setup_logging(&args.log_file)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let mut signal_receiver = signal_channel().await?;

    let config_path = match args.config_path.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = %e, config_file = %args.config_path.display(), "error canonicalizing config path");
            return Err(exitcode::NOINPUT);
        }
    };
    let store = config::Store::new(config_path);

    // migrate legacy configuration shapes once at startup
    match store.upgrade() {
        Ok(_) => (),
        Err(e) => {
            tracing::error!(error = ?e, "unable to read initial configuration file");
            return Err(exitcode::CONFIG);
        }
    }

    let socket_path = args.socket_path.clone();
    let socket = socket_listener(&args.socket_path).await?;

    let (conn, handle, _) = rtnetlink::new_connection().map_err(|e| {
        tracing::error!(error = %e, "failed to create netlink connection");
        exitcode::OSERR
    })?;
    tokio::spawn(conn);

    let supervisor = reconciler::supervisor(store, handle).map_err(|e| {
        tracing::error!(error = ?e, "failed to wire up kernel drivers");
        exitcode::OSERR
    })?;

    if let Err(e) = supervisor.start().await {
        tracing::error!(error = ?e, "failed to start reconciler");
        return Err(match e {
            reconciler::Error::Config(_) => exitcode::CONFIG,
            _ => exitcode::OSERR,
        });
    }

    let supervisor = Arc::new(supervisor);
    let res = loop_daemon(
        &supervisor,
        &mut signal_receiver,
        socket,
        reload_handle,
        args.log_file.clone(),
    )
    .await;

    if let Err(e) = supervisor.stop().await {
        tracing::warn!(error = ?e, "error stopping reconciler on shutdown");
    }

    let _ = fs::remove_file(&socket_path).await.map_err(|err| {
        tracing::error!(error = ?err, "failed removing socket on shutdown");
    });

    res
}

async fn loop_daemon(
    supervisor: &Arc<RealSupervisor>,
    signal_receiver: &mut mpsc::Receiver<SignalMessage>,
    socket: UnixListener,
    reload_handle: Option<LogReloadHandle>,
    log_path: Option<PathBuf>,
) -> Result<(), exitcode::ExitCode> {
    tracing::info!("entering main daemon loop");

    loop {
        tokio::select! {
            Some(signal) = signal_receiver.recv() => match signal {
                SignalMessage::Shutdown => {
                    tracing::info!("initiate shutdown");
                    return Ok(());
                }
                SignalMessage::RotateLogs => {
                    // newsyslog already rotated the file before sending SIGHUP,
                    // so reopening creates the fresh one
                    if let (Some(handle), Some(path)) = (&reload_handle, &log_path) {
                        match logging::make_file_fmt_layer(path).map(|layer| handle.reload(layer)) {
                            Ok(_) => tracing::info!("reloaded logging layer after SIGHUP"),
                            Err(e) => {
                                eprintln!("failed to reopen log file {}: {e}", path.display());
                                return Err(exitcode::IOERR);
                            }
                        }
                    } else {
                        tracing::debug!("no log file configured, skipping log reload on SIGHUP");
                    }
                }
            },

            Ok((stream, _addr)) = socket.accept() => {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    incoming_on_socket(stream, supervisor).await;
                });
            }

            else => {
                tracing::error!("unexpected channel closure");
                return Err(exitcode::IOERR);
            }
        }
    }
}

async fn incoming_on_socket(stream: UnixStream, supervisor: Arc<RealSupervisor>) {
    let (reader_half, writer_half) = stream.into_split();
    let reader = BufReader::new(reader_half);
    let line = match reader.lines().next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            tracing::warn!("socket connection closed by peer");
            return;
        }
        Err(e) => {
            tracing::error!(error = ?e, "error reading from socket");
            return;
        }
    };

    let cmd = match serde_json::from_str::<Command>(&line) {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::error!(error = %e, %line, "failed parsing incoming socket command");
            return;
        }
    };
    tracing::debug!(command = %cmd, "received socket command");

    let resp = handle_cmd(&cmd, &supervisor).await;

    let serialized = match serde_json::to_string(&resp) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = ?e, "failed to serialize response");
            return;
        }
    };
    let mut writer = BufWriter::new(writer_half);
    let res = async {
        writer.write_all(serialized.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
    .await;
    if let Err(e) = res {
        tracing::error!(error = ?e, "failed to send response to socket");
    }
}

async fn handle_cmd(cmd: &Command, supervisor: &RealSupervisor) -> Response {
    match cmd {
        Command::Ping => Response::Pong,
        Command::Status => Response::Status(supervisor.status()),
        Command::Apply => match supervisor.apply_once().await {
            Ok(report) => Response::Apply(report),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Download => match supervisor.download().await {
            Ok(outcomes) => Response::Download(outcomes),
            Err(e) => Response::Error(e.to_string()),
        },
        Command::Restart => match supervisor.after_config_change().await {
            Ok(()) => Response::Restarted,
            Err(e) => Response::Error(e.to_string()),
        },
        Command::SetKillSwitch { ipset, enabled } => {
            let (name, enabled) = (ipset.clone(), *enabled);
            match supervisor
                .modify_config(move |cfg| cfg.set_kill_switch(&name, enabled))
                .await
            {
                Ok(()) => Response::Updated,
                Err(e) => Response::Error(e.to_string()),
            }
        }
    }
}

fn setup_logging(log_file: &Option<PathBuf>) -> Result<Option<LogReloadHandle>, exitcode::ExitCode> {
    match log_file {
        Some(log_path) => {
            let fmt_layer = logging::make_file_fmt_layer(log_path).map_err(|err| {
                eprintln!("Failed to open log file {}: {err}", log_path.display());
                exitcode::IOERR
            })?;
            Ok(Some(logging::setup_log_file(fmt_layer)))
        }
        None => {
            logging::setup_stdout();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    match daemon(args).await {
        Ok(_) => (),
        Err(code) => {
            tracing::warn!("abnormal exit");
            process::exit(code);
        }
    }
}
