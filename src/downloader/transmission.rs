use async_trait::async_trait;
use chrono::Utc;
use transmission_rpc::types::{
    BasicAuth, Id, TorrentAddArgs, TorrentAddedOrDuplicate, TorrentGetField,
    TorrentStatus as TransmissionStatus,
};
use transmission_rpc::SharableTransClient;

use crate::config;
use crate::downloader::{DownloaderClient, TorrentRecord};
use crate::error::DownloaderError;
use crate::persistence::ProgressMap;
use crate::stall::{Observation, TorrentStatus};
use crate::Release;

const NAME: &str = "Transmission";

/// Transmission has no stall timers of its own, so stalls are detected by
/// comparing byte counts between polls.
pub struct Client {
    inner: SharableTransClient,
    label: String,
    add_paused: bool,
}

impl Client {
    pub fn new(cfg: &config::Transmission) -> Result<Self, DownloaderError> {
        let password = cfg
            .password
            .resolve()
            .map_err(|source| DownloaderError::Credentials {
                backend: NAME.to_string(),
                source,
            })?;
        let url = cfg
            .url()
            .map_err(|err| DownloaderError::unavailable(NAME, err))?;

        let basic_auth = BasicAuth {
            user: cfg.user.clone(),
            password,
        };
        let inner = SharableTransClient::with_auth(url, basic_auth);

        Ok(Self {
            inner,
            label: cfg.category.clone(),
            add_paused: cfg.addpaused,
        })
    }
}

#[async_trait]
impl DownloaderClient for Client {
    fn name(&self) -> &str {
        NAME
    }

    async fn submit(&self, release: &Release) -> Result<String, DownloaderError> {
        log::info!("Sending `{}` to Transmission", release.title);

        let add: TorrentAddArgs = TorrentAddArgs {
            filename: Some(release.torrentfile.clone()),
            labels: Some(vec![self.label.clone()]),
            paused: Some(self.add_paused),
            ..TorrentAddArgs::default()
        };

        let response = match self.inner.torrent_add(add).await {
            Ok(response) => response,
            Err(err) => return Err(DownloaderError::unavailable(NAME, err)),
        };

        if !response.is_ok() {
            let reason = response.result;
            return Err(DownloaderError::rejected(
                NAME,
                format!("failed to add `{}`: {reason}", release.title),
            ));
        }

        let torrent = match response.arguments {
            TorrentAddedOrDuplicate::TorrentAdded(torrent)
            | TorrentAddedOrDuplicate::TorrentDuplicate(torrent) => torrent,
            #[allow(unreachable_patterns)]
            _ => return Err(DownloaderError::rejected(NAME, "unexpected add response")),
        };

        torrent
            .hash_string
            .map(|hash| hash.to_lowercase())
            .ok_or_else(|| DownloaderError::rejected(NAME, "add response carries no hash"))
    }

    async fn cancel(&self, download_id: &str) -> Result<bool, DownloaderError> {
        log::info!("Removing download {download_id} from Transmission");

        let response = self
            .inner
            .torrent_remove(vec![Id::Hash(download_id.to_string())], true)
            .await
            .map_err(|err| DownloaderError::unavailable(NAME, err))?;

        Ok(response.is_ok())
    }

    async fn status(
        &self,
        ids: &[String],
        stalled_for: Option<u32>,
        prior: &ProgressMap,
    ) -> Result<Vec<TorrentRecord>, DownloaderError> {
        let fields = vec![
            TorrentGetField::HashString,
            TorrentGetField::Name,
            TorrentGetField::Status,
            TorrentGetField::PercentDone,
            TorrentGetField::SizeWhenDone,
            TorrentGetField::LeftUntilDone,
        ];
        let ids = (!ids.is_empty()).then(|| ids.iter().cloned().map(Id::Hash).collect());

        let response = self
            .inner
            .torrent_get(Some(fields), ids)
            .await
            .map_err(|err| DownloaderError::unavailable(NAME, err))?;

        if !response.is_ok() {
            return Err(DownloaderError::rejected(NAME, response.result));
        }

        let now = Utc::now();
        let records = response
            .arguments
            .torrents
            .into_iter()
            .filter_map(|torrent| {
                let id = torrent.hash_string?.to_lowercase();
                let observation = Observation {
                    status: normalize(torrent.status, torrent.percent_done),
                    bytes: downloaded(torrent.size_when_done, torrent.left_until_done),
                    timers: None,
                };
                Some(TorrentRecord::observe(
                    id.clone(),
                    torrent.name.unwrap_or_default(),
                    &observation,
                    prior.get(&id),
                    stalled_for,
                    now,
                ))
            })
            .collect();

        Ok(records)
    }
}

fn normalize(status: Option<TransmissionStatus>, percent_done: Option<f32>) -> TorrentStatus {
    match status {
        Some(TransmissionStatus::Downloading) => TorrentStatus::Downloading,
        Some(TransmissionStatus::Seeding | TransmissionStatus::QueuedToSeed) => {
            TorrentStatus::Finished
        }
        Some(TransmissionStatus::Stopped) if percent_done.is_some_and(|done| done >= 1.0) => {
            TorrentStatus::Finished
        }
        _ => TorrentStatus::Unknown,
    }
}

fn downloaded(size_when_done: Option<i64>, left_until_done: Option<i64>) -> Option<u64> {
    let size = size_when_done?;
    let left = left_until_done?;
    u64::try_from(size - left).ok()
}
