use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::Level;

use sluice_core::{NoopRecorder, RunRecorder};
use sluice_hub::{RetentionPolicy, StreamHub};
use sluice_server::{Pipeline, PipelineRegistry, ServerConfig};
use sluice_settings::SluiceSettings;
use sluice_store::{Database, SqliteRecorder};
use sluice_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "sluice", version, about = "Resumable stream hub for long-running engine executions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve {
        /// Settings file (defaults to ~/.sluice/settings.json).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
    },
    /// Print the resolved settings as JSON and exit.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Serve { config, port, host } => {
            let mut settings = load(config.as_ref())?;
            if let Some(port) = port {
                settings.server.port = port;
            }
            if let Some(host) = host {
                settings.server.host = host;
            }
            settings.validate()?;
            serve(settings).await
        }
        Command::CheckConfig { config } => {
            let settings = load(config.as_ref())?;
            settings.validate()?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn load(path: Option<&PathBuf>) -> anyhow::Result<SluiceSettings> {
    let path = path.cloned().unwrap_or_else(sluice_settings::settings_path);
    sluice_settings::load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))
}

fn telemetry_config(settings: &SluiceSettings) -> TelemetryConfig {
    let log_level = settings.logging.level.parse().unwrap_or(Level::INFO);
    let module_levels = settings
        .logging
        .module_levels
        .iter()
        .filter_map(|(module, level)| Some((module.clone(), level.parse::<Level>().ok()?)))
        .collect();
    TelemetryConfig {
        log_level,
        module_levels,
        json: settings.logging.json,
    }
}

async fn serve(settings: SluiceSettings) -> anyhow::Result<()> {
    let telemetry = init_telemetry(telemetry_config(&settings));
    let metrics = telemetry.metrics();

    let recorder: Arc<dyn RunRecorder> = if settings.store.enabled {
        let db_path = settings.store.resolved_db_path();
        let db = Database::open(&db_path)
            .with_context(|| format!("opening run store at {}", db_path.display()))?;
        Arc::new(SqliteRecorder::new(db))
    } else {
        tracing::info!("run store disabled");
        Arc::new(NoopRecorder)
    };

    let mut pipelines = PipelineRegistry::new();
    for p in &settings.pipelines {
        let pipeline = Pipeline::from_settings(
            p,
            Arc::clone(&recorder),
            Arc::clone(&metrics),
            settings.server.max_error_chars,
        )
        .with_context(|| format!("building pipeline '{}'", p.name))?;
        tracing::info!(pipeline = %p.name, engine_url = %p.engine_url, scope = ?p.key_scope, "pipeline registered");
        pipelines.insert(pipeline);
    }
    if pipelines.is_empty() {
        tracing::warn!("no pipelines configured; only health and stats endpoints will answer");
    }

    let retention = RetentionPolicy {
        finished_ttl: Duration::from_secs(settings.hub.finished_ttl_secs),
        max_finished: settings.hub.max_finished_jobs,
    };
    let grace = Duration::from_secs(settings.server.shutdown_grace_secs);
    let hub = Arc::new(StreamHub::new(retention, metrics).with_wind_down(grace / 2));
    let sweeper = hub.start_sweeper(Duration::from_secs(settings.hub.sweep_interval_secs));

    let config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        keep_alive: (settings.server.keep_alive_secs > 0)
            .then(|| Duration::from_secs(settings.server.keep_alive_secs)),
    };
    let handle = sluice_server::start(config, Arc::clone(&hub), pipelines)
        .await
        .context("starting server")?;

    tracing::info!(port = handle.port, "sluice server ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    let drained = hub.shutdown(grace).await;
    let stopped = handle.stop(grace).await;
    sweeper.abort();
    tracing::info!(drained, stopped, "shutdown complete");
    Ok(())
}
