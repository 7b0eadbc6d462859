use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";

pub fn make_file_fmt_layer(log_path: &Path) -> io::Result<FileFmtLayer> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// install global collector writing to stdout, configured based on RUST_LOG env var
pub fn setup_stdout() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

/// install global collector writing to a log file,
/// returning a reload handle so the file can be reopened after rotation
pub fn setup_log_file(fmt_layer: FileFmtLayer) -> LogReloadHandle {
    let (reload_layer, reload_handle): (reload::Layer<FileFmtLayer, tracing_subscriber::Registry>, LogReloadHandle) =
        reload::Layer::new(fmt_layer);
    tracing_subscriber::registry().with(reload_layer).with(env_filter()).init();
    reload_handle
}
