use cellblock::config::ConfinementConfig;
use cellblock::confinement::{
    ConfinementRegistry, ConfinementService, ContainmentEnforcer, ExpirationSweeper,
    LaborProgressTracker, LogSink, PersistenceMirror, RetryPolicy, YamlStore,
};
use cellblock::logging::{self, log_console};
use cellblock::script::{Script, ScriptRunner};
use cellblock::sim::SimWorld;
use cellblock::status::spawn_status_ticker;
use cellblock::world::WorldScheduler;
use cellblock::{CRATE_NAME, Error};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config/cellblock.yaml";
const DEFAULT_DATA_PATH: &str = "data/confinements.yaml";

async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let config_path =
        env::var("CELLBLOCK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let data_path = env::var("CELLBLOCK_DATA").unwrap_or_else(|_| DEFAULT_DATA_PATH.to_string());
    let config = ConfinementConfig::load(&config_path).await?;

    let store = Arc::new(YamlStore::new(&data_path));
    let mirror = PersistenceMirror::new(store, RetryPolicy::from(&config.persistence));
    let registry = ConfinementRegistry::with_mirror(mirror);

    let world = Arc::new(SimWorld::new());
    let (scheduler, world_loop) = WorldScheduler::new();
    let service = ConfinementService::new(
        config.clone(),
        world.clone(),
        scheduler,
        registry,
        Arc::new(LogSink),
    );
    let labor = LaborProgressTracker::new(service.clone());
    let enforcer = ContainmentEnforcer::new(service.clone(), labor.clone());
    world.route_teleports_through(enforcer.clone());

    // Nothing may touch the registry before this finishes
    let restored = service.restore().await?;
    info!(restored, data = %data_path, "{CRATE_NAME} starting");

    let world_task = tokio::spawn(world_loop.run());
    let restock = labor.clone();
    service.scheduler().run(move || {
        restock.restock();
    });
    let sweeper = ExpirationSweeper::from_service(service.clone()).start();
    let maintenance_every = Duration::from_secs(config.labor.maintenance_interval_secs.max(1));
    let maintenance = labor.start_maintenance(maintenance_every);
    let status_every = Duration::from_millis(config.status_interval_ms.max(100));
    let ticker = spawn_status_ticker(service.clone(), status_every);

    if let Some(script_path) = env::args().nth(1) {
        let script = Script::load(&script_path).await?;
        let report = ScriptRunner::new(enforcer.clone(), world.clone()).run(&script).await;
        log_console(format!(
            "Script {script_path}: {} steps, {} denied, {} failed",
            report.steps, report.denied, report.failed
        ));
        if script.edits_cells() {
            service.cells.save(&config, &config_path).await?;
            info!(config = %config_path, "Saved cell layout");
        }
    } else {
        log_console("Running, press Ctrl-C to stop".to_string());
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down");
    sweeper.shutdown().await;
    maintenance.abort();
    ticker.abort();

    let displays = service.displays.clone();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    service.scheduler().run(move || {
        let removed = displays.remove_all();
        info!(removed, "Removed labor displays");
        let _ = done_tx.send(());
    });
    if done_rx.await.is_err() {
        error!("World loop stopped before displays were removed");
    }
    world_task.abort();

    if let Some(mirror) = service.registry.mirror() {
        mirror.flush().await;
    }
    info!("{CRATE_NAME} stopped");
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error building runtime: {err}");
            return;
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
    }
}
