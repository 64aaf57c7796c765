//! The named tasks and how their triggers follow from the config.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::config::{Config, ConfigStore};
use crate::error::SchedulerError;
use crate::persistence::PersistenceGateway;
use crate::postprocessing::{self, DirectoryScan};
use crate::reconcile::Reconciler;
use crate::scheduler::{action, Anchor, Scheduler, Trigger};

pub const UPDATE_CHECKER: &str = "Update Checker";
pub const MOVIE_SEARCH: &str = "Movie Search";
pub const IMDB_SYNC: &str = "IMDB Sync";
pub const POPULAR_MOVIES_SYNC: &str = "PopularMovies Sync";
pub const TRAKT_SYNC: &str = "Trakt Sync";
pub const POSTPROCESSING_SCAN: &str = "PostProcessing Scan";
pub const MISSING_FILES_SCAN: &str = "Missing Files Scan";
pub const METADATA_UPDATE: &str = "Metadata Update";
pub const POSTPROCESSED_PATHS_SCAN: &str = "Postprocessed Paths Scan";
pub const TORRENTS_STATUS_CHECK: &str = "Torrents Status Check";

pub const ALL: [&str; 10] = [
    UPDATE_CHECKER,
    MOVIE_SEARCH,
    IMDB_SYNC,
    POPULAR_MOVIES_SYNC,
    TRAKT_SYNC,
    POSTPROCESSING_SCAN,
    MISSING_FILES_SCAN,
    METADATA_UPDATE,
    POSTPROCESSED_PATHS_SCAN,
    TORRENTS_STATUS_CHECK,
];

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether a trigger is derived for the initial registration or for a live
/// reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occasion {
    Startup,
    Reload,
}

fn minutes(n: u32) -> Duration {
    MINUTE * n
}

fn hours(n: u32) -> Duration {
    HOUR * n
}

/// Trigger of `task` under `cfg`, `None` for a name that isn't one of ours.
pub fn trigger_for(
    task: &str,
    cfg: &Config,
    now: DateTime<Local>,
    occasion: Occasion,
) -> Option<Trigger> {
    let watchlists = &cfg.search.watchlists;
    let scanner = &cfg.postprocessing.scanner;
    let files = &cfg.system.file_management;

    let every = |interval: Duration, auto_start: bool| {
        Trigger::new(Anchor::after(now, interval), interval, auto_start)
    };

    let trigger = match task {
        UPDATE_CHECKER => every(
            hours(cfg.server.checkupdatefrequency),
            cfg.server.checkupdates,
        ),
        MOVIE_SEARCH => every(minutes(cfg.search.rsssyncfrequency), true),
        IMDB_SYNC => every(minutes(watchlists.imdbfrequency), watchlists.imdbsync),
        POPULAR_MOVIES_SYNC => Trigger::new(
            Anchor::new(watchlists.popularmovieshour, watchlists.popularmoviesmin),
            DAY,
            watchlists.popularmoviessync,
        ),
        TRAKT_SYNC => every(minutes(watchlists.traktfrequency), trakt_enabled(cfg)),
        POSTPROCESSING_SCAN => every(minutes(scanner.interval), scanner.enabled),
        MISSING_FILES_SCAN => Trigger::new(
            Anchor::new(files.scanmissinghour, files.scanmissingmin),
            DAY,
            files.scanmissingfiles,
        ),
        METADATA_UPDATE => Trigger::new(Anchor::after(now, Duration::ZERO), 3 * DAY, true),
        POSTPROCESSED_PATHS_SCAN => Trigger::new(Anchor::after(now, Duration::ZERO), HOUR, true),
        TORRENTS_STATUS_CHECK => torrent_check_trigger(cfg, now, occasion),
        _ => return None,
    };
    Some(trigger)
}

fn trakt_enabled(cfg: &Config) -> bool {
    let watchlists = &cfg.search.watchlists;
    if !watchlists.traktsync {
        return false;
    }
    if watchlists.traktlists.values().any(|&enabled| enabled) {
        return true;
    }
    log::warn!("Trakt sync enabled but no lists are enabled");
    false
}

/// Runs hourly while at least one enabled backend removes finished torrents
/// or handles stalled ones, stays registered but disabled otherwise.
fn torrent_check_trigger(cfg: &Config, now: DateTime<Local>, occasion: Occasion) -> Trigger {
    if cfg.monitored_backends().is_empty() {
        return Trigger::new(Anchor::new(0, 0), HOUR, false);
    }
    let delay = match occasion {
        Occasion::Startup => Duration::ZERO,
        Occasion::Reload => HOUR,
    };
    Trigger::new(Anchor::after(now, delay), HOUR, true)
}

/// Jobs implemented outside this crate: searching, list syncing, library
/// maintenance and updates.
#[async_trait]
pub trait MediaServices: Send + Sync {
    async fn search_all(&self) -> anyhow::Result<()>;
    async fn check_updates(&self, install: bool) -> anyhow::Result<()>;
    async fn sync_imdb(&self, feeds: &[String]) -> anyhow::Result<()>;
    async fn sync_popular_movies(&self) -> anyhow::Result<()>;
    async fn sync_trakt(&self, lists: &[String]) -> anyhow::Result<()>;
    async fn scan_missing_files(&self) -> anyhow::Result<()>;
    async fn update_metadata(&self) -> anyhow::Result<()>;
}

/// Stands in for services that were not wired up; every job only logs.
pub struct Unconfigured;

#[async_trait]
impl MediaServices for Unconfigured {
    async fn search_all(&self) -> anyhow::Result<()> {
        log::info!("Movie search has no indexers configured");
        Ok(())
    }

    async fn check_updates(&self, install: bool) -> anyhow::Result<()> {
        log::info!("Update check skipped (install: {install})");
        Ok(())
    }

    async fn sync_imdb(&self, feeds: &[String]) -> anyhow::Result<()> {
        log::info!("IMDB sync skipped for {} feeds", feeds.len());
        Ok(())
    }

    async fn sync_popular_movies(&self) -> anyhow::Result<()> {
        log::info!("Popular movies sync skipped");
        Ok(())
    }

    async fn sync_trakt(&self, lists: &[String]) -> anyhow::Result<()> {
        log::info!("Trakt sync skipped for {lists:?}");
        Ok(())
    }

    async fn scan_missing_files(&self) -> anyhow::Result<()> {
        log::info!("Missing files scan skipped");
        Ok(())
    }

    async fn update_metadata(&self) -> anyhow::Result<()> {
        log::info!("Metadata update skipped");
        Ok(())
    }
}

/// What the task actions need.
pub struct JobContext {
    pub config: Arc<ConfigStore>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub services: Arc<dyn MediaServices>,
    pub scan: Arc<DirectoryScan>,
    pub reconciler: Arc<Reconciler>,
}

/// Creates every task with a trigger derived from the current config.
pub fn register(
    scheduler: &Scheduler,
    ctx: &JobContext,
    now: DateTime<Local>,
) -> Result<(), SchedulerError> {
    let cfg = ctx.config.snapshot();

    for task in ALL {
        let Some(trigger) = trigger_for(task, &cfg, now, Occasion::Startup) else {
            continue;
        };
        scheduler.create_task(task, trigger, task_action(task, ctx))?;
    }
    Ok(())
}

fn task_action(task: &'static str, ctx: &JobContext) -> crate::scheduler::Action {
    let config = ctx.config.clone();
    let gateway = ctx.gateway.clone();
    let services = ctx.services.clone();
    let scan = ctx.scan.clone();
    let reconciler = ctx.reconciler.clone();

    action(move || {
        let config = config.clone();
        let gateway = gateway.clone();
        let services = services.clone();
        let scan = scan.clone();
        let reconciler = reconciler.clone();

        async move {
            let cfg = config.snapshot();
            match task {
                UPDATE_CHECKER => services.check_updates(cfg.server.installupdates).await,
                MOVIE_SEARCH => services.search_all().await,
                IMDB_SYNC => services.sync_imdb(&cfg.search.watchlists.imdbrss).await,
                POPULAR_MOVIES_SYNC => services.sync_popular_movies().await,
                TRAKT_SYNC => {
                    let lists: Vec<String> = cfg
                        .search
                        .watchlists
                        .traktlists
                        .iter()
                        .filter(|(_, &enabled)| enabled)
                        .map(|(list, _)| list.clone())
                        .collect();
                    services.sync_trakt(&lists).await
                }
                POSTPROCESSING_SCAN => scan.run().await,
                MISSING_FILES_SCAN => services.scan_missing_files().await,
                METADATA_UPDATE => services.update_metadata().await,
                POSTPROCESSED_PATHS_SCAN => postprocessing::prune_paths(gateway.as_ref()),
                TORRENTS_STATUS_CHECK => reconciler.run().await,
                _ => Ok(()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 10, 20, 0).unwrap()
    }

    fn trigger(task: &str, cfg: &Config) -> Trigger {
        trigger_for(task, cfg, now(), Occasion::Startup).unwrap()
    }

    #[test]
    fn every_task_has_a_trigger() {
        let cfg = Config::default();
        for task in ALL {
            assert!(trigger_for(task, &cfg, now(), Occasion::Startup).is_some());
        }
        assert!(trigger_for("Nightly Backup", &cfg, now(), Occasion::Startup).is_none());
    }

    #[test]
    fn relative_tasks_start_one_interval_from_now() {
        let mut cfg = Config::default();
        cfg.search.rsssyncfrequency = 30;

        let search = trigger(MOVIE_SEARCH, &cfg);
        assert_eq!(search.anchor, Anchor::new(10, 50));
        assert_eq!(search.interval, Duration::from_secs(30 * 60));
        assert!(search.auto_start);

        let updates = trigger(UPDATE_CHECKER, &cfg);
        assert_eq!(updates.anchor, Anchor::new(10, 20));
        assert_eq!(updates.interval, Duration::from_secs(48 * 3600));
    }

    #[test]
    fn daily_tasks_use_the_configured_time() {
        let mut cfg = Config::default();
        cfg.system.file_management.scanmissingfiles = true;
        cfg.system.file_management.scanmissinghour = 4;
        cfg.system.file_management.scanmissingmin = 15;

        let scan = trigger(MISSING_FILES_SCAN, &cfg);
        assert_eq!(scan.anchor, Anchor::new(4, 15));
        assert_eq!(scan.interval, DAY);
        assert!(scan.auto_start);

        assert!(!trigger(POPULAR_MOVIES_SYNC, &cfg).auto_start);
    }

    #[test]
    fn trakt_needs_an_enabled_list() {
        let mut cfg = Config::default();
        cfg.search.watchlists.traktsync = true;
        assert!(!trigger(TRAKT_SYNC, &cfg).auto_start);

        cfg.search
            .watchlists
            .traktlists
            .insert("trending".to_string(), true);
        assert!(trigger(TRAKT_SYNC, &cfg).auto_start);
    }

    #[test]
    fn torrent_check_follows_backend_settings() {
        let mut cfg = Config::default();
        let idle = trigger(TORRENTS_STATUS_CHECK, &cfg);
        assert_eq!(idle, Trigger::new(Anchor::new(0, 0), HOUR, false));

        cfg.downloader.torrent.deluge_web.enabled = true;
        cfg.downloader.torrent.deluge_web.removetorrents = true;
        assert!(!trigger(TORRENTS_STATUS_CHECK, &cfg).auto_start);

        cfg.downloader.torrent.deluge_web.removestalledfor = 6;
        let startup = trigger(TORRENTS_STATUS_CHECK, &cfg);
        assert!(startup.auto_start);
        assert_eq!(startup.anchor, Anchor::new(10, 20));

        let reload = trigger_for(TORRENTS_STATUS_CHECK, &cfg, now(), Occasion::Reload).unwrap();
        assert_eq!(reload.anchor, Anchor::new(11, 20));
    }
}
