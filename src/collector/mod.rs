pub mod synthetic;

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::IdentityCache;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::listener::{IdentityCaches, ServiceCallListener};
use crate::pipeline::Pipeline;
use crate::registry::RoleRegistry;
use crate::roles;
use crate::storage::{MemoryIdentityDao, MemoryStore, PersistenceDao};

use self::synthetic::SyntheticStats;

/// Collector wires the registry, identity caches, pipeline and listener
/// together and owns their lifecycle.
pub struct Collector {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Arc<MemoryStore>,
    pipeline: Option<Arc<Pipeline>>,
    caches: Option<Arc<IdentityCaches>>,
    listener: Option<Arc<ServiceCallListener>>,
    synthetic: Option<JoinHandle<SyntheticStats>>,
    cancel: CancellationToken,
}

impl Collector {
    /// Creates a new Collector, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            store: Arc::new(MemoryStore::new()),
            pipeline: None,
            caches: None,
            listener: None,
            synthetic: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn listener(&self) -> Option<&Arc<ServiceCallListener>> {
        self.listener.as_ref()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Start all components and begin accepting deltas.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Role topology.
        let registry =
            RoleRegistry::from_source(&roles::schema_source(), |role| self.cfg.role_settings(role))
                .context("building role registry")?;
        let registry = Arc::new(registry);
        for topology in registry.iter() {
            info!(
                role = %topology.role(),
                shards = topology.shards(),
                selector = topology.selector().policy().as_str(),
                need_merge_with_storage = topology.need_merge_with_storage(),
                "role configured",
            );
        }

        // 2. Shard workers.
        let store = Arc::clone(&self.store);
        let pipeline = Pipeline::start(
            registry,
            |topology| store.table(topology.role()) as Arc<dyn PersistenceDao>,
            self.cfg.pipeline.flush_interval,
            &self.health,
        )
        .context("starting pipeline")?;
        let pipeline = Arc::new(pipeline);

        // 3. Identity caches.
        let settings = self.cfg.identity_cache.settings();
        let caches = Arc::new(IdentityCaches {
            application: IdentityCache::new(
                "application",
                Arc::new(MemoryIdentityDao::<String>::registering()),
                settings,
                &self.health,
            ),
            instance: IdentityCache::new(
                "instance",
                Arc::new(MemoryIdentityDao::<(i32, String)>::registering()),
                settings,
                &self.health,
            ),
            service: IdentityCache::new(
                "service",
                Arc::new(MemoryIdentityDao::<(i32, String)>::registering()),
                settings,
                &self.health,
            ),
        });

        // 4. Listener.
        let listener = Arc::new(ServiceCallListener::new(
            Arc::clone(&caches),
            Arc::clone(&pipeline),
            self.cfg.listener.apdex_threshold,
            &self.health,
        ));

        // 5. Optional synthetic traffic.
        if self.cfg.synthetic.enabled {
            let handle = synthetic::spawn(
                Arc::clone(&listener),
                self.cfg.synthetic.agents,
                self.cfg.synthetic.interval,
                self.cancel.clone(),
            )
            .context("starting synthetic traffic")?;
            self.synthetic = Some(handle);
        }

        self.pipeline = Some(pipeline);
        self.caches = Some(caches);
        self.listener = Some(listener);

        info!("collector started");
        Ok(())
    }

    /// Stops producers, drains the pipeline with a final flush and shuts
    /// the caches and health server down.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.synthetic.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(stats)) => info!(
                    dispatched = stats.dispatched,
                    parked = stats.parked,
                    "synthetic traffic joined",
                ),
                Ok(Err(_)) => error!("synthetic traffic thread panicked"),
                Err(e) => error!(error = %e, "joining synthetic traffic"),
            }
        }

        self.listener = None;

        if let Some(pipeline) = self.pipeline.take() {
            let retained = tokio::task::spawn_blocking(move || pipeline.shutdown())
                .await
                .context("waiting for pipeline shutdown")?;
            if retained > 0 {
                warn!(retained, "pipeline stopped with unflushed rows");
            }
        }

        if let Some(caches) = self.caches.take() {
            caches.shutdown();
        }

        info!(rows = self.store.row_count(), "collector stopped");

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::HealthConfig;
    use crate::listener::{Delivery, ServiceCall};
    use crate::registry::Role;

    fn test_config() -> Config {
        let mut cfg = Config {
            health: HealthConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ..Default::default()
        };
        cfg.pipeline.flush_interval = Duration::from_millis(50);
        cfg
    }

    #[tokio::test]
    async fn test_start_dispatch_stop() {
        let mut collector = Collector::new(test_config()).expect("collector");
        collector.start().await.expect("starts");

        let listener = Arc::clone(collector.listener().expect("listener after start"));
        let call = ServiceCall {
            application_code: "shop".to_string(),
            instance_key: "agent-0".to_string(),
            service_name: "/cart".to_string(),
            segment_id: "s1".to_string(),
            start_time_ms: 1_704_101_400_000,
            duration_ms: 42,
            is_error: false,
        };
        assert_eq!(listener.on_delta(&call).expect("dispatch"), Delivery::Dispatched);
        drop(listener);

        collector.stop().await.expect("stops");

        let store = collector.store();
        for role in roles::ALL_ROLES {
            assert_eq!(store.table(&Role::new(role)).len(), 1, "role {role}");
        }
    }

    #[tokio::test]
    async fn test_synthetic_traffic_reaches_store() {
        let mut cfg = test_config();
        cfg.synthetic.enabled = true;
        cfg.synthetic.agents = 2;
        cfg.synthetic.interval = Duration::from_millis(5);

        let mut collector = Collector::new(cfg).expect("collector");
        collector.start().await.expect("starts");
        tokio::time::sleep(Duration::from_millis(100)).await;
        collector.stop().await.expect("stops");

        assert!(collector.store().row_count() > 0);
    }
}
