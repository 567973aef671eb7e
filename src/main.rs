use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use geoq::config::Config;
use geoq::job::JobContext;
use geoq::kv::PgStore;
use geoq::pipeline::geocode::AddokGeocoder;
use geoq::project::ProjectStore;
use geoq::storage::Storage;
use geoq::{monitor, server, telemetry};

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: Config) -> Result<(), Error> {
    let kv = PgStore::new(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to the store")?;
    let kv = Arc::new(kv);

    let storage = Storage::from_config(&config.storage()?).await?;
    info!(backend = storage.backend_name(), "Object storage ready");

    let store = Arc::new(ProjectStore::new(kv.clone(), Arc::new(storage)));
    let geocoder = AddokGeocoder::new(&config.addok_service_url, config.geocode_concurrency)?;
    let ctx = Arc::new(JobContext {
        store: Arc::clone(&store),
        geocoder: Arc::new(geocoder),
        geocode_batch_size: config.geocode_batch_size,
    });

    let monitor_spawn = tokio::spawn(
        monitor::run(cancel_token.clone(), store, config.monitor_options())
            .instrument(info_span!("monitor")),
    );

    let result = server::serve(cancel_token.clone(), ctx, config.serve_options(), None)
        .instrument(info_span!("server"))
        .await;

    cancel_token.cancel();
    monitor_spawn.await?;
    kv.close().await;

    result
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let app = tokio::spawn(setup(token.clone(), config));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });

    let result = app.await?;
    if let Err(err) = &result {
        error!(message = "Worker stopped with an error", error = ?err);
    }
    info!("Shutting down.");
    telemetry::shutdown();

    result
}
