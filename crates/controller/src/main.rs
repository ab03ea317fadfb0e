mod analyzer;
mod config;
mod executor;
mod planner;
mod state;
mod weather;
mod web;

use anyhow::Result;
use irrigation_common::backend::BackendClient;
use irrigation_common::bus::BusConnection;
use irrigation_common::{seed, settings};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use analyzer::Analyzer;
use config::{ControllerConfig, Service};
use executor::Executor;
use planner::Planner;
use weather::WeatherClient;

#[tokio::main]
async fn main() -> Result<()> {
    settings::init_logging();

    // ── Env config ──────────────────────────────────────────────────
    let cfg = ControllerConfig::from_env()?;
    let backend = BackendClient::new(&cfg.backend.url, cfg.backend.timeout)?;

    // ── Seed file (first run only) ──────────────────────────────────
    if let Some(path) = &cfg.seed_path {
        let seed = seed::load(path)?;
        if let Err(e) = seed::apply(&seed, &backend).await {
            warn!("seeding skipped: {e:#}");
        }
    }

    // ── Shared status + web ─────────────────────────────────────────
    let shared = state::shared();
    shared
        .write()
        .await
        .record_system(format!("controller started ({} service(s))", cfg.services.len()));

    let web_state = Arc::clone(&shared);
    let web_port = cfg.web_port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("status api stopped: {e:#}");
        }
    });

    // ── Services ────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    for service in &cfg.services {
        let client_id = service.client_id();
        match service {
            Service::Analyzer => {
                let bus =
                    BusConnection::connect(&client_id, &cfg.mqtt, &analyzer::subscriptions()).await?;
                let registry = analyzer::load_registry(&backend).await;
                let weather = WeatherClient::new(&cfg.weather)?;
                if !weather.enabled() {
                    warn!("WEATHER_API_KEY not set, rain is never predicted");
                }
                let analyzer = Arc::new(Analyzer::new(
                    registry,
                    backend.clone(),
                    weather,
                    bus.client.clone(),
                    Arc::clone(&shared),
                    cfg.analyzer.clone(),
                ));
                tasks.spawn(analyzer.run(bus, stop_rx.clone()));
            }
            Service::Planner => {
                let bus =
                    BusConnection::connect(&client_id, &cfg.mqtt, &planner::subscriptions()).await?;
                let planner = Planner::new(bus.client.clone(), Arc::clone(&shared), cfg.water_need_liters);
                tasks.spawn(planner.run(bus, stop_rx.clone()));
            }
            Service::Executor => {
                let bus =
                    BusConnection::connect(&client_id, &cfg.mqtt, &executor::subscriptions()).await?;
                let executor = Executor::new(bus.client.clone(), Arc::clone(&shared));
                tasks.spawn(executor.run(bus, stop_rx.clone()));
            }
        }
        info!(service = %service, "service started");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        Some(res) = tasks.join_next() => {
            if let Err(e) = res {
                error!("service task failed: {e}");
            }
        }
    }

    let _ = stop_tx.send(true);
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!("service task failed during shutdown: {e}");
        }
    }
    Ok(())
}
