use async_trait::async_trait;

use crate::downloader::{timed, DownloaderClient};
use crate::error::ReconcileError;
use crate::persistence::{PersistenceGateway, ProgressSnapshot};
use crate::{Movie, Release, ResultStatus, SearchResult};

/// Picks replacement releases. Scoring and ranking live behind this trait.
#[async_trait]
pub trait SnatchArbiter: Send + Sync {
    /// The best release for `movie` not tried yet, other than `exclude_guid`.
    async fn best_alternate(
        &self,
        movie: &Movie,
        exclude_guid: &str,
    ) -> anyhow::Result<Option<Release>>;
}

/// Never has anything to offer, so stalled downloads are only removed.
pub struct NoAlternates;

#[async_trait]
impl SnatchArbiter for NoAlternates {
    async fn best_alternate(
        &self,
        movie: &Movie,
        _exclude_guid: &str,
    ) -> anyhow::Result<Option<Release>> {
        log::debug!("No release source configured for {}", movie.imdbid);
        Ok(None)
    }
}

/// Sends `release` to `client` and records it as Snatched. An empty progress
/// snapshot is stored so the next status check starts tracking it.
pub async fn snatch(
    client: &dyn DownloaderClient,
    gateway: &dyn PersistenceGateway,
    release: &Release,
) -> Result<SearchResult, ReconcileError> {
    log::info!("Snatch {} {}", release.guid, release.title);
    let download_id = timed(client.name(), client.submit(release)).await?;

    let result = SearchResult {
        guid: release.guid.clone(),
        imdbid: release.imdbid.clone(),
        title: release.title.clone(),
        status: ResultStatus::Snatched,
        download_id: Some(download_id.clone()),
        download_client: Some(client.name().to_string()),
    };
    gateway.record_snatch(&result)?;
    gateway.set_progress(client.name(), &download_id, ProgressSnapshot::default())?;

    log::info!(
        "Sent {} to {} as {download_id}",
        release.title,
        client.name()
    );
    Ok(result)
}
