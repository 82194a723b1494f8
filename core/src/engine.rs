use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::event::{EngineEvent, EventBus};
use crate::fetch::{FetchEvent, ItemFetcher, ItemStage};
use crate::job::{BatchJob, ItemOutcome, JobId, JobReport};
use crate::link::{LinkReference, LinkResolver};
use crate::metadata::{HttpMetadataSource, ItemMetadata, MetadataSource};
use crate::progress::{byte_percentage, ProgressAggregator};
use crate::provider::{MediaProvider, YtDlpProvider};
use crate::settings::{MemorySettingsStore, SettingKey, Settings, SettingsStore};
use crate::temp::TempAssets;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running {
        link: LinkReference,
        job: Option<JobId>,
    },
    /// Held by a caller about to exit the process; no batch may start.
    ShuttingDown,
}

pub struct DownloadEngine {
    pub config: EngineConfig,
    resolver: LinkResolver,
    metadata: Arc<dyn MetadataSource>,
    provider: Arc<dyn MediaProvider>,
    settings: Arc<Mutex<Box<dyn SettingsStore>>>,
    temp: Arc<TempAssets>,
    events: Arc<EventBus>,
    state: Arc<Mutex<EngineState>>,
    handle: Mutex<Option<JoinHandle<CoreResult<JobReport>>>>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        let resolver = LinkResolver::new(&config.link_prefix)?;
        let metadata = HttpMetadataSource::new(
            &config.metadata_endpoint,
            &config.user_agent,
            config.metadata_timeout,
        )?;
        let provider = YtDlpProvider::new(
            config.ytdlp_bin.clone(),
            config.search_results,
            config.provider_timeout,
            config.download_timeout,
        );
        let temp = TempAssets::new(config.temp_dir.clone());
        Ok(Self {
            config,
            resolver,
            metadata: Arc::new(metadata),
            provider: Arc::new(provider),
            settings: Arc::new(Mutex::new(Box::new(MemorySettingsStore::default()))),
            temp: Arc::new(temp),
            events: Arc::new(EventBus::default()),
            state: Arc::new(Mutex::new(EngineState::Idle)),
            handle: Mutex::new(None),
        })
    }

    pub fn with_settings(mut self, settings: Box<dyn SettingsStore>) -> Self {
        self.settings = Arc::new(Mutex::new(settings));
        self
    }

    pub fn with_metadata_source(mut self, metadata: Box<dyn MetadataSource>) -> Self {
        self.metadata = Arc::from(metadata);
        self
    }

    pub fn with_provider(mut self, provider: Box<dyn MediaProvider>) -> Self {
        self.provider = Arc::from(provider);
        self
    }

    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn resolve(&self, link: &str) -> CoreResult<LinkReference> {
        self.resolver.resolve(link)
    }

    pub fn state(&self) -> CoreResult<EngineState> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| CoreError::InvalidState("state lock poisoned".to_string()))
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), Ok(EngineState::Running { .. }))
    }

    pub fn settings(&self) -> CoreResult<Settings> {
        self.settings
            .lock()
            .map_err(|_| CoreError::SettingsIo("settings lock poisoned".to_string()))?
            .load()
    }

    pub fn set_setting(&self, key: SettingKey, value: &str) -> CoreResult<()> {
        self.settings
            .lock()
            .map_err(|_| CoreError::SettingsIo("settings lock poisoned".to_string()))?
            .set(key, value)
    }

    /// Starts a batch on a worker thread. Fails with [`CoreError::Busy`] while
    /// another batch runs.
    pub fn submit(&self, link: &str) -> CoreResult<LinkReference> {
        let link = self.resolver.resolve(link)?;
        self.claim(&link)?;
        self.reap();

        let runner = self.runner();
        let job_link = link.clone();
        let handle = thread::spawn(move || runner.run(job_link));
        self.handle
            .lock()
            .map_err(|_| CoreError::InvalidState("handle lock poisoned".to_string()))?
            .replace(handle);
        Ok(link)
    }

    /// Runs a batch on the calling thread.
    pub fn run(&self, link: &str) -> CoreResult<JobReport> {
        let link = self.resolver.resolve(link)?;
        self.claim(&link)?;
        self.runner().run(link)
    }

    /// Blocks until the submitted batch finishes. `None` when nothing was
    /// submitted.
    pub fn wait(&self) -> Option<CoreResult<JobReport>> {
        let handle = self.handle.lock().ok()?.take()?;
        Some(join_worker(handle))
    }

    /// Moves an idle engine to [`EngineState::ShuttingDown`] so later
    /// submissions fail with [`CoreError::Busy`]. Fails with `Busy` while a
    /// batch runs.
    pub fn claim_for_shutdown(&self) -> CoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CoreError::InvalidState("state lock poisoned".to_string()))?;
        match &*state {
            EngineState::Idle => {
                *state = EngineState::ShuttingDown;
                info!("engine reserved for shutdown");
                Ok(())
            }
            EngineState::ShuttingDown => Ok(()),
            EngineState::Running { .. } => Err(CoreError::Busy),
        }
    }

    /// Returns a shutdown claim, e.g. after a failed restart.
    pub fn release_shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            if *state == EngineState::ShuttingDown {
                *state = EngineState::Idle;
            }
        }
    }

    fn claim(&self, link: &LinkReference) -> CoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CoreError::InvalidState("state lock poisoned".to_string()))?;
        match &*state {
            EngineState::Idle => {}
            EngineState::Running { link: running, .. } => {
                warn!(running = %running, rejected = %link, "download already running");
                return Err(CoreError::Busy);
            }
            EngineState::ShuttingDown => {
                warn!(rejected = %link, "engine is shutting down");
                return Err(CoreError::Busy);
            }
        }
        *state = EngineState::Running {
            link: link.clone(),
            job: None,
        };
        Ok(())
    }

    fn reap(&self) {
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(old) = handle.take() {
                if let Err(err) = join_worker(old) {
                    warn!(error = %err, "previous batch ended with an error");
                }
            }
        }
    }

    fn runner(&self) -> BatchRunner {
        BatchRunner {
            canonical_extension: self.config.canonical_extension.clone(),
            metadata: Arc::clone(&self.metadata),
            provider: Arc::clone(&self.provider),
            settings: Arc::clone(&self.settings),
            temp: Arc::clone(&self.temp),
            events: Arc::clone(&self.events),
            state: Arc::clone(&self.state),
        }
    }
}

struct BatchRunner {
    canonical_extension: String,
    metadata: Arc<dyn MetadataSource>,
    provider: Arc<dyn MediaProvider>,
    settings: Arc<Mutex<Box<dyn SettingsStore>>>,
    temp: Arc<TempAssets>,
    events: Arc<EventBus>,
    state: Arc<Mutex<EngineState>>,
}

impl BatchRunner {
    fn run(&self, link: LinkReference) -> CoreResult<JobReport> {
        let _reset = ResetGuard {
            state: Arc::clone(&self.state),
            temp: Arc::clone(&self.temp),
            events: Arc::clone(&self.events),
        };

        let metadata = match self.metadata.fetch(&link) {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = if err.is_batch_fatal() {
                    err
                } else {
                    CoreError::MetadataFetchFailed(err.to_string())
                };
                error!(link = %link, error = %err, "batch aborted");
                self.events
                    .emit(EngineEvent::Status(format!("Error downloading {}", link.kind())));
                self.events.emit(EngineEvent::JobFailed {
                    link,
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        let thumbnail = metadata.thumbnail_url().map(str::to_string);
        let mut job = BatchJob::new(link.kind(), metadata, self.destination_root());
        if let Ok(mut state) = self.state.lock() {
            *state = EngineState::Running {
                link: link.clone(),
                job: Some(job.id),
            };
        }
        info!(job = %job.id, link = %link, items = job.total_items(), "batch started");
        self.events.emit(EngineEvent::JobStarted {
            job: job.id,
            link,
            total: job.total_items(),
            destination: job.destination(),
        });
        if let Some(url) = thumbnail {
            self.show_thumbnail(job.id, &url);
        }

        let mut report = JobReport::new(&job);
        let mut progress = ProgressAggregator::new();
        let fetcher = ItemFetcher::new(self.provider.as_ref(), &self.canonical_extension);
        let dest = job.destination();
        let total = job.total_items();
        let items = job.items.clone();

        for (index, item) in items.into_iter().enumerate() {
            self.stage(job.id, index, ItemStage::Fetching);
            self.events
                .emit(EngineEvent::Status(downloading_status(&item, index, total)));

            let job_id = job.id;
            let observer = |event: FetchEvent| self.forward(job_id, index, event);
            let outcome = match fetcher.fetch(&item, &dest, &observer) {
                Ok(fetched) => {
                    self.events.emit(EngineEvent::Status(format!(
                        "Downloaded : {}",
                        item.display_name()
                    )));
                    ItemOutcome::Downloaded {
                        path: fetched.path,
                        tier: fetched.tier,
                    }
                }
                Err(err) => {
                    warn!(job = %job_id, item = %item.title, error = %err, "item failed");
                    self.events.emit(EngineEvent::Status(format!(
                        "Error downloading : {}",
                        item.display_name()
                    )));
                    ItemOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            };
            self.events.emit(EngineEvent::ItemFinished {
                job: job_id,
                index,
                success: outcome.is_success(),
            });
            report.outcomes.push((item, outcome));

            let processed = job.mark_processed()?;
            self.stage(job_id, index, ItemStage::Counted);
            if let Some(percent) = progress.update(processed, total) {
                self.events.emit(EngineEvent::Progress {
                    job: job_id,
                    processed,
                    total,
                    percent,
                });
            }
            self.events.emit(EngineEvent::StreamProgress {
                job: job_id,
                index,
                downloaded: 0,
                total: None,
                percent: Some(0),
            });
        }

        info!(job = %job.id, succeeded = report.succeeded(), failed = report.failed(), "batch finished");
        self.events.emit(EngineEvent::JobFinished(report.clone()));
        Ok(report)
    }

    fn destination_root(&self) -> PathBuf {
        let configured = match self.settings.lock() {
            Ok(mut settings) => match settings.load() {
                Ok(settings) => settings.download_path(),
                Err(err) => {
                    warn!(error = %err, "settings unavailable, using default download path");
                    None
                }
            },
            Err(_) => None,
        };
        configured
            .or_else(dirs::download_dir)
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn show_thumbnail(&self, job: JobId, url: &str) {
        let stored = self
            .metadata
            .fetch_thumbnail(url)
            .and_then(|bytes| self.temp.store(&bytes));
        match stored {
            Ok(path) => self.events.emit(EngineEvent::Thumbnail { job, path }),
            Err(err) => warn!(url, error = %err, "continuing without thumbnail"),
        }
    }

    fn stage(&self, job: JobId, index: usize, stage: ItemStage) {
        self.events.emit(EngineEvent::ItemStage { job, index, stage });
    }

    fn forward(&self, job: JobId, index: usize, event: FetchEvent) {
        match event {
            FetchEvent::Stage(stage) => self.stage(job, index, stage),
            FetchEvent::TierFailed { tier, error } => self.events.emit(EngineEvent::TierFailed {
                job,
                index,
                tier,
                error,
            }),
            FetchEvent::Bytes { downloaded, total } => {
                self.events.emit(EngineEvent::StreamProgress {
                    job,
                    index,
                    downloaded,
                    total,
                    percent: byte_percentage(downloaded, total),
                })
            }
        }
    }
}

/// Joins a batch worker, mapping a panic to [`CoreError::InvalidState`].
pub(crate) fn join_worker(handle: JoinHandle<CoreResult<JobReport>>) -> CoreResult<JobReport> {
    handle
        .join()
        .unwrap_or_else(|_| Err(CoreError::InvalidState("download worker panicked".to_string())))
}

fn downloading_status(item: &ItemMetadata, index: usize, total: usize) -> String {
    if total > 1 {
        format!("Downloading : ({}/{}) {}", index + 1, total, item.display_name())
    } else {
        format!("Downloading : {}", item.display_name())
    }
}

/// Returns the engine to idle and discards temp assets however the batch
/// ends.
struct ResetGuard {
    state: Arc<Mutex<EngineState>>,
    temp: Arc<TempAssets>,
    events: Arc<EventBus>,
}

impl Drop for ResetGuard {
    fn drop(&mut self) {
        self.temp.clear();
        match self.state.lock() {
            Ok(mut state) => *state = EngineState::Idle,
            Err(poisoned) => *poisoned.into_inner() = EngineState::Idle,
        }
        self.events.emit(EngineEvent::Status(String::new()));
        self.events.emit(EngineEvent::Reset);
    }
}
