//! `tracing`-subscriber setup from the `logging` section of [`crate::config::Config`].
//!
//! Grounded on `spfs-cli-common`'s `Logging::configure`: a stderr layer plus
//! optional syslog and file layers, each independently filtered by an
//! [`tracing_subscriber::filter::EnvFilter`] built from the configured level
//! and per-module overrides (`module_levels` here plays the role of
//! `alpenhorn`'s `logging.module_levels` directive).

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use crate::config::LoggingConfig;
use crate::error::Result;

fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    let base_level = if cfg.level.is_empty() { "info" } else { cfg.level.as_str() };
    let mut directive = format!("alpenhorn={base_level}");
    for (module, level) in &cfg.module_levels {
        directive.push(',');
        directive.push_str(module);
        directive.push('=');
        directive.push_str(level);
    }
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global `tracing` subscriber. Must be called exactly once,
/// before any other subsystem logs.
pub fn init(cfg: &LoggingConfig) -> Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(build_filter(cfg));

    let syslog_layer = cfg.syslog.enable.then(|| {
        let identity = std::ffi::CString::new("alpenhorn").expect("no interior NUL");
        let facility = cfg
            .syslog
            .facility
            .as_deref()
            .and_then(parse_facility)
            .unwrap_or(syslog_tracing::Facility::Daemon);
        syslog_tracing::Syslog::new(identity, Default::default(), facility)
            .ok()
            .map(|writer| {
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .without_time()
                    .with_filter(build_filter(cfg))
            })
    }).flatten();

    let file_layer = cfg
        .file
        .name
        .as_ref()
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        })
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_filter(build_filter(cfg))
        });

    tracing_subscriber::registry()
        .with(LevelFilter::TRACE)
        .with(stderr_layer)
        .with(syslog_layer)
        .with(file_layer)
        .init();

    Ok(())
}

fn parse_facility(name: &str) -> Option<syslog_tracing::Facility> {
    use syslog_tracing::Facility::*;
    Some(match name.to_ascii_lowercase().as_str() {
        "daemon" => Daemon,
        "user" => User,
        "local0" => Local0,
        "local1" => Local1,
        "local2" => Local2,
        "local3" => Local3,
        "local4" => Local4,
        "local5" => Local5,
        "local6" => Local6,
        "local7" => Local7,
        _ => return None,
    })
}
