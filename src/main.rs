use std::sync::Arc;

use tracing::info;

use washline::cache::TtlCache;
use washline::clock::{Clock, SystemClock};
use washline::config::Config;
use washline::detector::ChangeDetector;
use washline::engine::{Engine, EngineSettings};
use washline::notify::{LogNotifier, Notifier};
use washline::scheduler::{Scheduler, SchedulerSettings, run_scheduler};
use washline::store::{JournalStore, RetryPolicy, Retrying, Stores};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    washline::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let journal_path = config.data_dir.join("washline.journal");
    let journal = JournalStore::open(&journal_path)?;
    let backend = Arc::new(Retrying::new(journal, RetryPolicy::default()));
    let stores = Stores::from_backend(backend);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(TtlCache::new(Some(config.cache_ttl), clock.clone()));
    let engine = Arc::new(Engine::new(
        stores.clone(),
        cache.clone(),
        clock,
        EngineSettings::from(&config),
    ));
    let detector = Arc::new(ChangeDetector::new(stores.probe.clone(), cache));
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let scheduler = Arc::new(Scheduler::new(
        engine,
        notifier,
        detector,
        SchedulerSettings::from(&config),
    ));

    info!("washline started");
    info!("  journal: {}", journal_path.display());
    info!("  admins: {:?}", config.admin_ids);
    info!("  tick: {:?}", config.tick);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let ticker = tokio::spawn(run_scheduler(scheduler));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping scheduler");
    ticker.abort();
    let _ = ticker.await;
    info!("washline stopped");
    Ok(())
}
