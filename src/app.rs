use std::sync::Arc;

use chrono::Local;

use crate::config::{Config, ConfigChange, ConfigStore};
use crate::downloader::{Registry, SharedRegistry};
use crate::error::{ConfigError, SchedulerError};
use crate::jobs::{self, JobContext, MediaServices, Unconfigured};
use crate::persistence::PersistenceGateway;
use crate::postprocessing::{DirectoryScan, LogOnly, PostProcessor};
use crate::reconcile::Reconciler;
use crate::router::{route, ConfigDiff, Reload};
use crate::scheduler::Scheduler;
use crate::snatch::{NoAlternates, SnatchArbiter};

/// Collaborators supplied by the host.
pub struct Services {
    pub media: Arc<dyn MediaServices>,
    pub processor: Arc<dyn PostProcessor>,
    pub arbiter: Arc<dyn SnatchArbiter>,
}

impl Services {
    /// Services that only log what they would do.
    pub fn inert() -> Self {
        Services {
            media: Arc::new(Unconfigured),
            processor: Arc::new(LogOnly),
            arbiter: Arc::new(NoAlternates),
        }
    }
}

pub struct App {
    config: Arc<ConfigStore>,
    registry: Arc<SharedRegistry>,
    scheduler: Scheduler,
}

impl App {
    /// Builds the backend registry and registers every task. Nothing runs
    /// until [`App::start`].
    pub fn new(
        config: Arc<ConfigStore>,
        gateway: Arc<dyn PersistenceGateway>,
        services: Services,
    ) -> Result<Self, SchedulerError> {
        let registry = Arc::new(SharedRegistry::new(Registry::from_config(
            &config.snapshot(),
        )));
        let scheduler = Scheduler::new(gateway.clone());

        let ctx = JobContext {
            config: config.clone(),
            gateway: gateway.clone(),
            services: services.media,
            scan: Arc::new(DirectoryScan::new(
                config.clone(),
                gateway.clone(),
                services.processor,
            )),
            reconciler: Arc::new(Reconciler::new(
                config.clone(),
                registry.clone(),
                gateway,
                services.arbiter,
            )),
        };
        jobs::register(&scheduler, &ctx, Local::now())?;

        Ok(App {
            config,
            registry,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.current()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Commits a complete config and reloads the tasks it affects. A
    /// rejected config changes nothing. Writes are applied in commit order.
    pub fn write_config(&self, cfg: Config) -> Result<Vec<Reload>, ConfigError> {
        self.config.write_then(cfg, |change| self.apply(change))
    }

    /// Picks up edits made to the config file on disk.
    pub fn reload_config(&self) -> Result<Vec<Reload>, ConfigError> {
        self.config.reload_then(|change| self.apply(change))
    }

    fn apply(&self, change: &ConfigChange) -> Vec<Reload> {
        let diff = ConfigDiff::between(&change.old.to_tree(), &change.new.to_tree());
        if diff.is_empty() {
            log::debug!("Config unchanged");
            return Vec::new();
        }

        let reloads = route(&diff, &change.new, Local::now());
        for reload in &reloads {
            if let Err(err) = self.scheduler.reload(reload.task, reload.trigger) {
                log::error!("Unable to reload task `{}`: {err}", reload.task);
            }
        }

        if diff.get(&["Downloader"]).is_some() {
            log::info!("Downloader settings changed, rebuilding backends");
            self.registry.replace(Registry::from_config(&change.new));
        }

        reloads
    }
}
