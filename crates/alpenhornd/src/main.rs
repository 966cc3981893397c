//! Entry point: configuration, logging, the database pool, and the
//! top-level run loop.

mod cli;
mod io_factory;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use diesel::prelude::*;
use diesel_async::AsyncConnection;

use alpenhorn_common::config::{self, Config};
use alpenhorn_common::extensions::validate_known;
use alpenhorn_common::{logging, metrics};
use alpenhorn_daemon::HostUpdateLoop;
use alpenhorn_db::pool::{self, DbPool};
use cli::{Cli, Command, DbCommand};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match config::load(cli.conf.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("alpenhornd: configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("alpenhornd: failed to initialise logging: {e}");
        return ExitCode::from(2);
    }

    const KNOWN_EXTENSIONS: &[&str] = &[];
    if let Err(e) = validate_known(&config.extensions, KNOWN_EXTENSIONS) {
        tracing::error!(error = %e, "unknown extension requested in configuration");
        return ExitCode::from(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Command::Db { command: DbCommand::Init } => runtime.block_on(db_init(&config)),
        Command::Run { once } => runtime.block_on(run(config, once)),
    }
}

async fn db_init(config: &Config) -> ExitCode {
    use diesel_migrations::MigrationHarness;

    let url = config.database.url.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = diesel::pg::PgConnection::establish(&url).map_err(|e| e.to_string())?;
        conn.run_pending_migrations(alpenhorn_db::MIGRATIONS)
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
    .await;

    match result {
        Ok(Ok(())) => {
            tracing::info!("database schema initialised");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "migration failed");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "migration task panicked");
            ExitCode::from(2)
        }
    }
}

/// Retry the initial pool connection with exponential backoff, since the
/// database may not be up yet when the daemon starts (e.g. both are
/// brought up together by an orchestrator). Subsequent per-worker
/// reconnects after a transient error are handled separately by the
/// worker pool's respawn logic, not this helper.
async fn connect_with_retry(database_url: &str) -> alpenhorn_db::Result<DbPool> {
    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .build();

    backoff::future::retry(policy, || async {
        pool::connect(database_url).await.map_err(|e| {
            tracing::warn!(error = %e, "database connection attempt failed, retrying");
            backoff::Error::transient(e)
        })
    })
    .await
}

async fn run(config: Config, once: bool) -> ExitCode {
    let db_pool: DbPool = match connect_with_retry(&config.database.url).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to database after retrying");
            return ExitCode::from(2);
        }
    };

    {
        let mut conn = match db_pool.get().await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to acquire a database connection");
                return ExitCode::from(2);
            }
        };
        if let Err(e) = pool::check_schema_version(&mut conn).await {
            tracing::error!(error = %e, "schema check failed");
            return ExitCode::from(2);
        }
    }

    let host = config
        .daemon
        .host
        .clone()
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());

    if config.daemon.prom_client_port > 0 {
        let port = config.daemon.prom_client_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(port).await {
                tracing::error!(error = %e, "metrics server exited");
            }
        });
    }

    let mut update_loop = HostUpdateLoop::new(
        db_pool,
        host,
        config.daemon.clone(),
        Box::new(io_factory::BuiltinNodeFactory),
        Box::new(io_factory::BuiltinGroupFactory),
        Vec::new(),
    );

    let step = |task: &Arc<alpenhorn_scheduler::Task>| {
        alpenhorn_scheduler::pool::execute(
            task,
            |t| {
                let finished = t.run();
                match t.take_error() {
                    None => Ok(finished),
                    Some(transient) => Err(transient),
                }
            },
            |transient: &bool| *transient,
        )
    };
    let pool = alpenhorn_scheduler::WorkerPool::new(config.daemon.num_workers as usize, update_loop.queue.clone(), step);
    if let Err(e) = alpenhorn_scheduler::pool::install_resize_signals(pool.clone()) {
        tracing::warn!(error = %e, "failed to install SIGUSR1/SIGUSR2 worker-resize handlers");
    }

    let update_interval = Duration::from_secs(config.daemon.update_interval);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    loop {
        let started = std::time::Instant::now();

        pool.check();

        if let Err(e) = update_loop.run_once().await {
            tracing::error!(error = %e, "update pass failed");
            alpenhorn_scheduler::trigger_global_abort();
        }

        if alpenhorn_scheduler::global_abort() {
            tracing::warn!("global abort set; exiting");
            pool.shutdown();
            return ExitCode::from(1);
        }

        if once {
            tracing::info!("once mode: single pass complete");
            pool.shutdown();
            return ExitCode::SUCCESS;
        }

        let elapsed = started.elapsed();
        let remaining = update_interval.saturating_sub(elapsed);

        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received interrupt; shutting down cleanly");
                pool.shutdown();
                return ExitCode::SUCCESS;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM; shutting down cleanly");
                pool.shutdown();
                return ExitCode::SUCCESS;
            }
        }
    }
}
