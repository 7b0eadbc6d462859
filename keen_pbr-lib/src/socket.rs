//! Client side of the daemon's unix domain socket.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use std::io;
use std::path::Path;

use crate::command::{Command, Response};

pub const DEFAULT_PATH: &str = "/var/run/keen_pbr.sock";
pub const ENV_VAR: &str = "KEEN_PBR_SOCKET_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("failed serializing command: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

pub async fn process_cmd(socket_path: &Path, cmd: &Command) -> Result<Response, Error> {
    check_path(socket_path)?;

    let mut stream = UnixStream::connect(socket_path).await?;

    let json_cmd = serde_json::to_string(cmd)?;
    push_command(&mut stream, &json_cmd).await?;
    let str_resp = pull_response(&mut stream).await?;
    serde_json::from_str::<Response>(&str_resp).map_err(Error::Serialization)
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(x) => Err(x.into()),
    }
}

async fn push_command(socket: &mut UnixStream, json_cmd: &str) -> Result<(), Error> {
    // flush is not enough to push the command
    // we need to shutdown the write channel to signal the other side that all data was transferred
    socket.write_all(json_cmd.as_bytes()).await?;
    socket.flush().await?;
    socket.shutdown().await.map_err(Error::from)
}

async fn pull_response(socket: &mut UnixStream) -> Result<String, Error> {
    let mut response = String::new();
    socket
        .read_to_string(&mut response)
        .await
        .map(|_size| response)
        .map_err(Error::from)
}
