//! Launcher daemon assembly: providers, pool workers, cleanup and min-ready.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use fleet_launcher::{
    CleanupWorker, FakeProvider, LaunchCounter, LauncherConfig, MinReadyWorker, NodeLauncher,
    PoolContext, PoolWorker, ProviderManager,
};
use fleet_state::{Session, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Provider driver implemented in-process.
pub const FAKE_DRIVER: &str = "fake";

struct Provider {
    manager: Arc<dyn ProviderManager>,
    launcher: Arc<dyn NodeLauncher>,
}

pub struct Daemon {
    store: StateStore,
    session: Session,
    providers: Vec<Arc<dyn ProviderManager>>,
    workers: Vec<PoolWorker>,
    cleanup: CleanupWorker,
    cleanup_interval: Duration,
    min_ready: MinReadyWorker,
    watermark_sleep: Duration,
}

impl Daemon {
    /// Build the launcher described by `config` on top of `store`.
    ///
    /// Providers are started here; every pool gets a launcher id of the form
    /// `<name>-<pid>-<provider>-<pool>`.
    pub fn new(store: StateStore, config: &LauncherConfig, name: &str) -> anyhow::Result<Self> {
        config.validate()?;
        let session = store.open_session();
        let pid = std::process::id();

        let mut providers = Vec::new();
        let mut managers: HashMap<String, Arc<dyn ProviderManager>> = HashMap::new();
        let mut workers = Vec::new();

        for provider_config in &config.providers {
            let provider = build_provider(
                &provider_config.name,
                &provider_config.driver,
                provider_config.rate,
            )?;

            let shared_config = Arc::new(provider_config.clone());
            let launches = LaunchCounter::new();
            for pool in &provider_config.pools {
                let ctx = PoolContext {
                    launcher_id: launcher_id(name, pid, &provider_config.name, &pool.name),
                    store: store.clone(),
                    session: session.clone(),
                    provider: Arc::clone(&shared_config),
                    pool: Arc::new(pool.clone()),
                    manager: Arc::clone(&provider.manager),
                    launcher: Arc::clone(&provider.launcher),
                    launches: launches.clone(),
                };
                workers.push(PoolWorker::standard(ctx, config.launcher.watermark_sleep()));
            }

            managers.insert(provider_config.name.clone(), Arc::clone(&provider.manager));
            providers.push(provider.manager);
        }

        // Only start providers once every driver resolved.
        for (provider, provider_config) in providers.iter().zip(&config.providers) {
            provider.start()?;
            info!(
                provider = %provider_config.name,
                driver = %provider_config.driver,
                rate = provider_config.rate,
                pools = provider_config.pools.len(),
                "provider started"
            );
        }

        let min_ready = MinReadyWorker::new(store.clone(), config, &managers);
        let max_ready_age = config
            .labels
            .iter()
            .filter_map(|l| l.max_ready_age().map(|age| (l.name.clone(), age)))
            .collect();
        let cleanup = CleanupWorker::new(
            store.clone(),
            session.clone(),
            &format!("{name}-{pid}-cleanup"),
            managers,
        )
        .with_max_ready_age(max_ready_age);

        Ok(Self {
            store,
            session,
            providers,
            workers,
            cleanup,
            cleanup_interval: config.launcher.cleanup_interval(),
            min_ready,
            watermark_sleep: config.launcher.watermark_sleep(),
        })
    }

    /// API router over this daemon's store.
    pub fn router(&self) -> Router {
        crate::api::build_router(self.store.clone())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn launcher_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.launcher_id().to_string()).collect()
    }

    /// Run every worker until `shutdown` fires, then stop the providers and
    /// close the store session.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Daemon {
            store,
            session,
            providers,
            workers,
            cleanup,
            cleanup_interval,
            mut min_ready,
            watermark_sleep,
        } = self;

        info!(
            session = session.id(),
            pool_workers = workers.len(),
            providers = providers.len(),
            "launcher daemon running"
        );

        let mut handles: Vec<JoinHandle<()>> = workers
            .into_iter()
            .map(|mut worker| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();
        let cleanup_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            cleanup.run(cleanup_interval, cleanup_shutdown).await
        }));
        let min_ready_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            min_ready.run(watermark_sleep, min_ready_shutdown).await
        }));

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }

        for provider in &providers {
            provider.stop();
        }
        for provider in &providers {
            provider.join().await;
            info!(provider = %provider.name(), "provider stopped");
        }

        store.expire_session(&session);
        info!("launcher daemon stopped");
        Ok(())
    }
}

fn build_provider(name: &str, driver: &str, rate: f64) -> anyhow::Result<Provider> {
    match driver {
        FAKE_DRIVER => {
            let fake = Arc::new(FakeProvider::from_rate(name, rate));
            Ok(Provider {
                manager: fake.clone(),
                launcher: fake,
            })
        }
        other => anyhow::bail!("provider {name}: driver {other} is not available in this build"),
    }
}

pub fn launcher_id(name: &str, pid: u32, provider: &str, pool: &str) -> String {
    format!("{name}-{pid}-{provider}-{pool}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_launcher::{PoolConfig, ProviderConfig};

    fn config(driver: &str) -> LauncherConfig {
        LauncherConfig {
            launcher: Default::default(),
            labels: Vec::new(),
            providers: vec![ProviderConfig {
                name: "cloud".into(),
                driver: driver.into(),
                rate: 10.0,
                max_concurrency: None,
                launch_retries: 1,
                pools: vec![
                    PoolConfig {
                        name: "east".into(),
                        max_servers: 2,
                        labels: vec!["small".into()],
                    },
                    PoolConfig {
                        name: "west".into(),
                        max_servers: 2,
                        labels: vec!["small".into()],
                    },
                ],
            }],
        }
    }

    #[tokio::test]
    async fn one_worker_per_pool() {
        let store = StateStore::open_in_memory().unwrap();
        let daemon = Daemon::new(store, &config(FAKE_DRIVER), "launcher").unwrap();
        let pid = std::process::id();
        assert_eq!(
            daemon.launcher_ids(),
            vec![
                format!("launcher-{pid}-cloud-east"),
                format!("launcher-{pid}-cloud-west"),
            ]
        );
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let err = Daemon::new(store, &config("openstack"), "launcher").err().unwrap();
        assert!(err.to_string().contains("openstack"));
    }
}
