mod actuator;
mod config;
mod sim;
mod station;

use anyhow::Result;
use irrigation_common::backend::BackendClient;
use irrigation_common::bus::BusConnection;
use irrigation_common::settings;
use irrigation_common::topology::Registry;
use tokio::sync::watch;
use tracing::{error, info, warn};

use config::FieldConfig;
use station::Station;

const CLIENT_ID: &str = "irrigation-field";

#[tokio::main]
async fn main() -> Result<()> {
    settings::init_logging();

    // ── Env config ──────────────────────────────────────────────────
    let cfg = FieldConfig::from_env()?;
    let backend = BackendClient::new(&cfg.backend.url, cfg.backend.timeout)?;

    // ── Topology ────────────────────────────────────────────────────
    let registry = match backend.get_zones().await {
        Ok(zones) => Registry::from_docs(&zones),
        Err(e) => {
            warn!("topology unavailable, retrying on connect and each tick: {e:#}");
            Registry::default()
        }
    };
    if registry.field_count() == 0 {
        warn!(backend = %backend.base_url(), "no fields configured");
    }

    // ── MQTT + station loop ─────────────────────────────────────────
    let bus = BusConnection::connect(CLIENT_ID, &cfg.mqtt, &station::subscriptions()).await?;
    let station = Station::new(registry, backend, bus.client.clone(), cfg.sim.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut task = tokio::spawn(station.run(bus, stop_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        res = &mut task => {
            if let Err(e) = res {
                error!("field station failed: {e}");
            }
            return Ok(());
        }
    }

    let _ = stop_tx.send(true);
    if let Err(e) = task.await {
        error!("field station failed during shutdown: {e}");
    }
    Ok(())
}
