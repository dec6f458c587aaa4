//! Relay events from a vendor API to an intake, deduplicating them on the way.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use relay_common::dedup::DedupCache;
use relay_common::health::HealthRegistry;
use relay_common::intake::{HttpIntake, Intake, PrintIntake};
use relay_common::metrics::{serve, setup_metrics_router};
use relay_common::queue::bounded;
use relay_worker::config::{required, Config, ConnectorKind, IntakeMode};
use relay_worker::cursor::PullCursor;
use relay_worker::source::office365::{HttpManagementApi, Office365Source};
use relay_worker::source::retarus::RetarusSource;
use relay_worker::supervisor::{RelaySupervisor, SupervisorConfig};

fn build_intake(config: &Config) -> anyhow::Result<Arc<dyn Intake>> {
    let intake = &config.intake;

    Ok(match intake.intake_mode {
        IntakeMode::Http => Arc::new(HttpIntake::new(
            &intake.intake_url,
            intake.intake_key.as_str(),
            intake.intake_chunk_size,
            intake.intake_timeout.0,
        )?),
        IntakeMode::Print => Arc::new(PrintIntake::new(intake.intake_key.as_str())),
    })
}

async fn build_supervisor(
    config: &Config,
    intake: Arc<dyn Intake>,
    registry: &HealthRegistry,
) -> anyhow::Result<RelaySupervisor> {
    let interval = config.poll_interval();
    let supervisor_config = SupervisorConfig {
        interval,
        sweep_interval: config.dedup_sweep_interval.0,
        stop_timeout: config.stop_timeout.0,
        batch_limit: config.queue.queue_get_limit,
        batch_block: config.queue.queue_get_block,
        batch_timeout: config.queue.queue_get_timeout.0,
        batch_retries: config.queue.queue_get_retries,
    };
    let cache = DedupCache::new(config.dedup_retention.0);
    // A tick may take a whole interval to complete, leave room for a slow one.
    let liveness = registry.register(
        "supervisor",
        time::Duration::seconds(i64::try_from(interval.as_secs() * 3 + 60)?),
    );

    let supervisor = match config.connector {
        ConnectorKind::Office365 => {
            let office365 = &config.office365;
            let api = HttpManagementApi::new(
                &office365.office365_base_url,
                &office365.office365_authority_url,
                required(&office365.office365_tenant_id, "OFFICE365_TENANT_ID")?,
                required(&office365.office365_client_id, "OFFICE365_CLIENT_ID")?,
                required(&office365.office365_client_secret, "OFFICE365_CLIENT_SECRET")?,
                required(&office365.office365_publisher_id, "OFFICE365_PUBLISHER_ID")?,
                config.intake.intake_timeout.0,
            )
            .context("failed to build the Office 365 client")?;
            let cursor = PullCursor::load(config.cursor_path.as_ref().map(PathBuf::from)).await;

            RelaySupervisor::polling(
                Box::new(Office365Source::new(
                    api,
                    office365.office365_content_types.0.clone(),
                )),
                cursor,
                intake,
                cache,
                liveness,
                supervisor_config,
            )
        }
        ConnectorKind::Retarus => {
            let retarus = &config.retarus;
            let source = RetarusSource::new(
                required(&retarus.retarus_ws_url, "RETARUS_WS_URL")?,
                required(&retarus.retarus_ws_key, "RETARUS_WS_KEY")?,
            );

            RelaySupervisor::streaming(
                Arc::new(source),
                bounded(config.queue.queue_size.get(), config.queue.full_queue_policy()),
                intake,
                cache,
                liveness,
                supervisor_config,
            )
        }
    };

    Ok(supervisor)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let intake = build_intake(&config)?;
    let registry = HealthRegistry::new("liveness");
    let mut supervisor = build_supervisor(&config, intake, &registry).await?;

    let shutdown = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => {},
            _ = interrupt.recv() => {},
        }
        tracing::info!("received shutdown signal");
        signalled.cancel();
    });

    let router = setup_metrics_router(registry)?;
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move { serve(router, &bind, server_shutdown).await });

    let result = supervisor.run(shutdown.clone()).await;

    // Stop serving metrics even if the relay failed to start.
    shutdown.cancel();
    if let Err(error) = server.await? {
        tracing::error!(%error, "metrics server failed");
    }

    result.context("relay failed")
}
