//! # Update Manager
//!
//! Owns every wallpaper update: when one is requested, whether it may run,
//! and what happens when it finishes.
//!
//! ## Ownership
//! A single actor task holds all mutable state (the in-flight run, the pending
//! timer, the observable [`Status`]). Triggers, timer fires and run completions
//! reach it as [`Command`]s over one channel, so they are handled strictly one
//! at a time. Pipeline runs execute on their own tasks so a slow download never
//! blocks the actor from accepting a newer request.
//!
//! ## Preemption
//!
//! | in flight | incoming | action |
//! |-----------|----------|--------|
//! | none      | any      | start |
//! | Timer     | Manual   | cancel in-flight, start |
//! | Manual    | Manual   | cancel in-flight, start |
//! | Manual    | Timer    | reject |
//! | Timer     | Timer    | reject |
//!
//! Cancellation is cooperative: a run checks its token after every suspending
//! step and stops before its next side effect.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{self, SettingsStore};
use crate::error::UpdateError;
use crate::photos::{PhotoSource, PhotoSourceError};
use crate::scheduler::{next_due_time, timer_delay, OneShotTimer};
use crate::selection::{self, CandidateFilter};
use crate::sink::WallpaperSink;

/// Identifies one accepted update run.
pub type RunId = Uuid;

/// Why an update was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTrigger {
    Timer,
    Manual,
}

impl UpdateTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Manual => "manual",
        }
    }
}

/// What to do with an incoming request given the in-flight run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preemption {
    Start,
    CancelAndStart,
    Reject,
}

pub fn preemption(in_flight: Option<UpdateTrigger>, incoming: UpdateTrigger) -> Preemption {
    use UpdateTrigger::{Manual, Timer};
    match (in_flight, incoming) {
        (None, _) => Preemption::Start,
        (Some(Timer), Manual) | (Some(Manual), Manual) => Preemption::CancelAndStart,
        (Some(Manual), Timer) | (Some(Timer), Timer) => Preemption::Reject,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Accepted { run: RunId, preempted: Option<RunId> },
    Rejected,
}

/// Read-only state for presentation layers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub last_successful_update: Option<DateTime<Utc>>,
    pub next_scheduled_update: Option<DateTime<Utc>>,
    pub last_update_error: Option<String>,
    pub in_flight: Option<UpdateTrigger>,
    pub automatic_updates: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Applied { item_id: String, at: DateTime<Utc> },
    Failed(String),
    Canceled,
}

/// Progress notifications, in the order the manager handled them.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    Started { run: RunId, trigger: UpdateTrigger },
    Rejected { trigger: UpdateTrigger },
    Finished { run: RunId, trigger: UpdateTrigger, outcome: RunOutcome },
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Wallpaper manager is not running")]
    Closed,
}

/// External collaborators of the pipeline.
pub struct Collaborators {
    pub photos: Arc<dyn PhotoSource>,
    pub store: Arc<dyn SettingsStore>,
    pub sink: Arc<dyn WallpaperSink>,
    /// The single file the wallpaper is written to.
    pub wallpaper_path: PathBuf,
}

enum Command {
    Request {
        trigger: UpdateTrigger,
        reply: Option<oneshot::Sender<RequestOutcome>>,
    },
    Start,
    Stop,
    SettingsChanged,
    Reconfigure(Arc<dyn PhotoSource>),
    TimerFired {
        generation: u64,
    },
    RunFinished {
        run: RunId,
        trigger: UpdateTrigger,
        result: Result<Applied, UpdateError>,
    },
}

/// Cloneable handle to a running [`WallpaperManager`].
#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    events: broadcast::Sender<UpdateEvent>,
}

impl ManagerHandle {
    fn send(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).map_err(|_| ManagerError::Closed)
    }

    /// The single entry point for update requests.
    pub async fn request_update(&self, trigger: UpdateTrigger) -> Result<RequestOutcome, ManagerError> {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::Request { trigger, reply: Some(reply) })?;
        outcome.await.map_err(|_| ManagerError::Closed)
    }

    /// Enables automatic updates and arms the first timer.
    pub fn start(&self) -> Result<(), ManagerError> {
        self.send(Command::Start)
    }

    /// Disables automatic updates and disarms the pending timer.
    pub fn stop(&self) -> Result<(), ManagerError> {
        self.send(Command::Stop)
    }

    /// Tells the manager that schedule-relevant settings were written.
    pub fn settings_changed(&self) -> Result<(), ManagerError> {
        self.send(Command::SettingsChanged)
    }

    /// Replaces the photo source used by subsequent runs.
    pub fn reconfigure(&self, photos: Arc<dyn PhotoSource>) -> Result<(), ManagerError> {
        self.send(Command::Reconfigure(photos))
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }
}

struct Applied {
    item_id: String,
    at: DateTime<Utc>,
}

/// Applies the optional network timeout to one photo service call.
async fn bounded<T>(
    limit: Option<Duration>,
    call: impl Future<Output = Result<T, PhotoSourceError>>,
) -> Result<T, UpdateError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| UpdateError::TimedOut(limit))?
            .map_err(UpdateError::from),
        None => call.await.map_err(UpdateError::from),
    }
}

fn ensure_live(token: &CancellationToken) -> Result<(), UpdateError> {
    if token.is_cancelled() {
        Err(UpdateError::Canceled)
    } else {
        Ok(())
    }
}

/// Replaces `path` with `bytes` via a temp file in the same directory.
async fn write_atomically(path: &Path, bytes: Vec<u8>) -> Result<(), UpdateError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let dir = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "Wallpaper path has no parent directory")
        })?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(())
}

/// One pass of fetch → filter → select → download → write → apply.
#[derive(Clone)]
struct Pipeline {
    photos: Arc<dyn PhotoSource>,
    store: Arc<dyn SettingsStore>,
    sink: Arc<dyn WallpaperSink>,
    wallpaper_path: PathBuf,
    /// Serialises the file write and sink call across runs.
    apply_lock: Arc<Mutex<()>>,
}

impl Pipeline {
    async fn run(&self, token: &CancellationToken) -> Result<Applied, UpdateError> {
        let settings = self.store.snapshot();
        let album_id = settings.album_id().ok_or(UpdateError::NoAlbumSelected)?.to_string();
        let timeout = settings.network_timeout();

        let items = bounded(timeout, self.photos.list_candidates(&album_id)).await?;
        ensure_live(token)?;

        let total = items.len();
        let candidates = CandidateFilter::from_config(&settings).apply(items);
        let picked = selection::select(
            candidates.len(),
            settings.selection_policy(),
            settings.last_picked_index,
            &mut rand::rng(),
        )
        .ok_or(UpdateError::NoCandidatesAfterFilter { total })?;
        let item = &candidates[picked.index];
        if let Some(index) = picked.advance_to {
            config::write_blocking(&self.store, move |s| s.set_last_picked_index(index)).await?;
        }
        debug!(
            item = %item.id,
            index = picked.index,
            candidates = candidates.len(),
            total,
            "Selected photo"
        );

        let bytes = bounded(timeout, self.photos.download_image(item)).await?;
        ensure_live(token)?;

        let _apply = self.apply_lock.lock().await;
        ensure_live(token)?;
        write_atomically(&self.wallpaper_path, bytes).await?;
        ensure_live(token)?;
        self.sink.apply(&self.wallpaper_path, settings.fill_mode).await?;

        let at = Utc::now();
        config::write_blocking(&self.store, move |s| s.set_last_successful_update(at)).await?;
        Ok(Applied { item_id: item.id.clone(), at })
    }
}

struct InFlight {
    id: RunId,
    trigger: UpdateTrigger,
    token: CancellationToken,
}

/// The actor behind [`ManagerHandle`].
pub struct WallpaperManager {
    pipeline: Pipeline,
    commands: mpsc::WeakUnboundedSender<Command>,
    status: watch::Sender<Status>,
    events: broadcast::Sender<UpdateEvent>,
    in_flight: Option<InFlight>,
    timer: Option<OneShotTimer>,
    timer_generation: u64,
    automatic: bool,
    /// Process-lifetime only; feeds the retry delay.
    last_attempt: Option<DateTime<Utc>>,
}

impl WallpaperManager {
    /// Spawns the actor on the current tokio runtime.
    ///
    /// Automatic updates stay off until [`ManagerHandle::start`]. The actor
    /// exits once every handle is dropped.
    pub fn spawn(collaborators: Collaborators) -> ManagerHandle {
        let (commands, mut inbox) = mpsc::unbounded_channel();
        let initial = Status {
            last_successful_update: collaborators.store.snapshot().last_successful_update,
            ..Status::default()
        };
        let (status, status_rx) = watch::channel(initial);
        let (events, _) = broadcast::channel(64);

        let mut manager = Self {
            pipeline: Pipeline {
                photos: collaborators.photos,
                store: collaborators.store,
                sink: collaborators.sink,
                wallpaper_path: collaborators.wallpaper_path,
                apply_lock: Arc::new(Mutex::new(())),
            },
            commands: commands.downgrade(),
            status,
            events: events.clone(),
            in_flight: None,
            timer: None,
            timer_generation: 0,
            automatic: false,
            last_attempt: None,
        };

        tokio::spawn(async move {
            while let Some(command) = inbox.recv().await {
                manager.handle(command);
            }
            manager.shutdown();
        });

        ManagerHandle { commands, status: status_rx, events }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Request { trigger, reply } => {
                let outcome = self.request_update(trigger);
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::Start => {
                self.automatic = true;
                self.status.send_modify(|s| s.automatic_updates = true);
                if self.in_flight.is_none() {
                    self.schedule_next();
                }
            }
            Command::Stop => self.stop(),
            Command::SettingsChanged => {
                if self.in_flight.is_none() {
                    self.schedule_next();
                }
            }
            Command::Reconfigure(photos) => {
                info!("Photo source replaced");
                self.pipeline.photos = photos;
            }
            Command::TimerFired { generation } => self.timer_fired(generation),
            Command::RunFinished { run, trigger, result } => self.run_finished(run, trigger, result),
        }
    }

    fn request_update(&mut self, trigger: UpdateTrigger) -> RequestOutcome {
        if trigger == UpdateTrigger::Manual {
            self.timer = None;
            self.status.send_modify(|s| s.next_scheduled_update = None);
        }

        let preempted = match preemption(self.in_flight.as_ref().map(|r| r.trigger), trigger) {
            Preemption::Reject => {
                info!(trigger = trigger.as_str(), "Update already in progress, ignoring request");
                let _ = self.events.send(UpdateEvent::Rejected { trigger });
                return RequestOutcome::Rejected;
            }
            Preemption::CancelAndStart => self.in_flight.take().map(|previous| {
                info!(run = %previous.id, "Canceling in-flight update");
                previous.token.cancel();
                previous.id
            }),
            Preemption::Start => None,
        };

        let run = self.start_run(trigger);
        RequestOutcome::Accepted { run, preempted }
    }

    fn start_run(&mut self, trigger: UpdateTrigger) -> RunId {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.last_attempt = Some(Utc::now());

        let pipeline = self.pipeline.clone();
        let commands = self.commands.clone();
        let run_token = token.clone();
        tokio::spawn(async move {
            let result = pipeline.run(&run_token).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::RunFinished { run: id, trigger, result });
            }
        });

        self.in_flight = Some(InFlight { id, trigger, token });
        self.status.send_modify(|s| s.in_flight = Some(trigger));
        let _ = self.events.send(UpdateEvent::Started { run: id, trigger });
        info!(run = %id, trigger = trigger.as_str(), "Wallpaper update started");
        id
    }

    fn run_finished(&mut self, run: RunId, trigger: UpdateTrigger, result: Result<Applied, UpdateError>) {
        let current = self.in_flight.as_ref().is_some_and(|r| r.id == run);
        if current {
            self.in_flight = None;
            self.status.send_modify(|s| s.in_flight = None);
        }

        let outcome = match result {
            Ok(applied) => {
                info!(run = %run, item = %applied.item_id, "Wallpaper updated");
                self.status.send_modify(|s| {
                    if s.last_successful_update.map_or(true, |prev| applied.at > prev) {
                        s.last_successful_update = Some(applied.at);
                    }
                    s.last_update_error = None;
                });
                RunOutcome::Applied { item_id: applied.item_id, at: applied.at }
            }
            // A superseded run was canceled even if it noticed too late.
            Err(e) if e.is_canceled() || !current => {
                debug!(run = %run, "Update canceled");
                RunOutcome::Canceled
            }
            Err(e) => {
                warn!(run = %run, error = %e, "Wallpaper update failed");
                let message = e.to_string();
                self.status.send_modify(|s| s.last_update_error = Some(message.clone()));
                RunOutcome::Failed(message)
            }
        };

        let canceled = outcome == RunOutcome::Canceled;
        let _ = self.events.send(UpdateEvent::Finished { run, trigger, outcome });

        // The superseding run schedules when it completes.
        if current && !canceled {
            self.schedule_next();
        }
    }

    fn timer_fired(&mut self, generation: u64) {
        match self.timer.take() {
            Some(timer) if timer.generation() == generation => {
                info!(due = %timer.due(), "Scheduled wallpaper update due");
            }
            pending => {
                self.timer = pending;
                debug!(generation, "Ignoring stale timer");
                return;
            }
        }
        self.request_update(UpdateTrigger::Timer);
    }

    /// Disarms the pending timer and arms a new one for the next due time.
    fn schedule_next(&mut self) {
        self.timer = None;

        let now = Utc::now();
        let due = if self.automatic {
            let settings = self.pipeline.store.snapshot();
            next_due_time(
                now,
                settings.change_frequency,
                settings.album_id().is_some(),
                settings.last_successful_update,
                self.last_attempt,
            )
        } else {
            None
        };
        self.status.send_modify(|s| s.next_scheduled_update = due);

        let Some(due) = due else {
            debug!("No automatic update scheduled");
            return;
        };

        self.timer_generation += 1;
        let generation = self.timer_generation;
        let commands = self.commands.clone();
        self.timer = Some(OneShotTimer::arm(generation, due, timer_delay(now, due), move || {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TimerFired { generation });
            }
        }));
        info!(due = %due.with_timezone(&chrono::Local).format("%a %b %d %H:%M"), "Next wallpaper update scheduled");
    }

    fn stop(&mut self) {
        self.automatic = false;
        self.timer = None;
        self.status.send_modify(|s| {
            s.automatic_updates = false;
            s.next_scheduled_update = None;
        });
        info!("Automatic wallpaper updates stopped");
    }

    fn shutdown(&mut self) {
        if let Some(run) = self.in_flight.take() {
            run.token.cancel();
        }
        self.timer = None;
    }
}

/// Checks at startup that the selected album still exists.
///
/// A vanished album is cleared from the settings so the scheduler stops
/// retrying it. Lookup failures only log; the selection is kept. The lookup
/// is bounded by the configured network timeout.
pub async fn verify_selected_album(photos: &dyn PhotoSource, store: &dyn SettingsStore) {
    let settings = store.snapshot();
    let Some(album_id) = settings.album_id() else {
        info!("No album selected");
        return;
    };

    match bounded(settings.network_timeout(), photos.find_album(album_id)).await {
        Ok(Some(album)) => {
            let title = album.title.as_deref().unwrap_or(album_id);
            match album.media_items_count {
                Some(0) => warn!(album = %title, "Selected album is empty"),
                count => info!(album = %title, items = ?count, "Using album"),
            }
        }
        Ok(None) => {
            warn!(album_id, "Selected album no longer exists, clearing selection");
            if let Err(e) = store.set_selected_album(None, None) {
                warn!(error = %e, "Failed to clear album selection");
            }
        }
        Err(e) => warn!(album_id, error = %e, "Could not verify selected album"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MemorySettingsStore};
    use crate::photos::{Album, MediaItem};
    use crate::sink::{FillMode, SinkError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(5);

    /// Holds one photo service call until released.
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    impl Gate {
        async fn pass(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    #[derive(Default)]
    struct FakePhotos {
        items: Vec<MediaItem>,
        list_error: Option<u16>,
        album_missing: bool,
        album_stalls: bool,
        list_gates: StdMutex<VecDeque<Arc<Gate>>>,
        download_gates: StdMutex<VecDeque<Arc<Gate>>>,
        downloads: AtomicUsize,
    }

    impl FakePhotos {
        fn with_items(items: Vec<MediaItem>) -> Self {
            Self { items, ..Self::default() }
        }

        fn gate_list(&self) -> Arc<Gate> {
            let gate = Arc::new(Gate::default());
            self.list_gates.lock().unwrap().push_back(gate.clone());
            gate
        }

        fn gate_download(&self) -> Arc<Gate> {
            let gate = Arc::new(Gate::default());
            self.download_gates.lock().unwrap().push_back(gate.clone());
            gate
        }
    }

    #[async_trait]
    impl PhotoSource for FakePhotos {
        async fn list_candidates(&self, _album_id: &str) -> Result<Vec<MediaItem>, PhotoSourceError> {
            let gate = self.list_gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            match self.list_error {
                Some(status) => Err(PhotoSourceError::Network {
                    status: Some(status),
                    message: "Service Unavailable".into(),
                }),
                None => Ok(self.items.clone()),
            }
        }

        async fn download_image(&self, item: &MediaItem) -> Result<Vec<u8>, PhotoSourceError> {
            let call = self.downloads.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = self.download_gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            Ok(format!("{}#{}", item.id, call).into_bytes())
        }

        async fn find_album(&self, album_id: &str) -> Result<Option<Album>, PhotoSourceError> {
            if self.album_stalls {
                std::future::pending::<()>().await;
            }
            if self.album_missing {
                return Ok(None);
            }
            Ok(Some(Album { id: album_id.into(), title: None, media_items_count: Some(self.items.len() as u64) }))
        }
    }

    #[derive(Default)]
    struct FakeSink {
        /// File contents at the moment each apply happened.
        applied: StdMutex<Vec<(Vec<u8>, FillMode)>>,
        no_display: bool,
        apply_gates: StdMutex<VecDeque<Arc<Gate>>>,
    }

    impl FakeSink {
        fn applied(&self) -> Vec<(Vec<u8>, FillMode)> {
            self.applied.lock().unwrap().clone()
        }

        fn gate_apply(&self) -> Arc<Gate> {
            let gate = Arc::new(Gate::default());
            self.apply_gates.lock().unwrap().push_back(gate.clone());
            gate
        }
    }

    #[async_trait]
    impl WallpaperSink for FakeSink {
        async fn apply(&self, path: &Path, fill_mode: FillMode) -> Result<(), SinkError> {
            if self.no_display {
                return Err(SinkError::DisplayUnavailable);
            }
            let gate = self.apply_gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                gate.pass().await;
            }
            let bytes = std::fs::read(path)?;
            self.applied.lock().unwrap().push((bytes, fill_mode));
            Ok(())
        }
    }

    fn photo(id: &str, width: u32, height: u32) -> MediaItem {
        MediaItem {
            id: id.into(),
            width: Some(width),
            height: Some(height),
            download_url: format!("https://photos.example/{id}=d"),
            mime_type: Some("image/jpeg".into()),
        }
    }

    fn three_photos() -> Vec<MediaItem> {
        vec![photo("p0", 4000, 3000), photo("p1", 4000, 3000), photo("p2", 4000, 3000)]
    }

    fn album_config() -> Config {
        Config {
            selected_album_id: Some("album".into()),
            minimum_picture_width: 800,
            ..Config::default()
        }
    }

    struct Harness {
        handle: ManagerHandle,
        photos: Arc<FakePhotos>,
        sink: Arc<FakeSink>,
        store: Arc<MemorySettingsStore>,
        path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn harness_with(config: Config, photos: FakePhotos, sink: FakeSink) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("wallpaper.jpg");
        let photos = Arc::new(photos);
        let sink = Arc::new(sink);
        let store = Arc::new(MemorySettingsStore::new(config));
        let handle = WallpaperManager::spawn(Collaborators {
            photos: photos.clone(),
            store: store.clone(),
            sink: sink.clone(),
            wallpaper_path: path.clone(),
        });
        Harness { handle, photos, sink, store, path, _dir: dir }
    }

    fn harness(config: Config, photos: FakePhotos) -> Harness {
        harness_with(config, photos, FakeSink::default())
    }

    async fn accepted(handle: &ManagerHandle, trigger: UpdateTrigger) -> (RunId, Option<RunId>) {
        match handle.request_update(trigger).await.unwrap() {
            RequestOutcome::Accepted { run, preempted } => (run, preempted),
            RequestOutcome::Rejected => panic!("{trigger:?} request was rejected"),
        }
    }

    async fn next_finished(events: &mut broadcast::Receiver<UpdateEvent>) -> (RunId, RunOutcome) {
        loop {
            let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let UpdateEvent::Finished { run, outcome, .. } = event {
                return (run, outcome);
            }
        }
    }

    #[test]
    fn test_preemption_table() {
        use UpdateTrigger::{Manual, Timer};
        assert_eq!(preemption(None, Timer), Preemption::Start);
        assert_eq!(preemption(None, Manual), Preemption::Start);
        assert_eq!(preemption(Some(Timer), Manual), Preemption::CancelAndStart);
        assert_eq!(preemption(Some(Manual), Timer), Preemption::Reject);
        assert_eq!(preemption(Some(Timer), Timer), Preemption::Reject);
        assert_eq!(preemption(Some(Manual), Manual), Preemption::CancelAndStart);
    }

    #[tokio::test]
    async fn test_sequential_update_wraps_and_applies() {
        let config = Config { last_picked_index: 2, fill_mode: FillMode::Stretch, ..album_config() };
        let h = harness(config, FakePhotos::with_items(three_photos()));
        let mut events = h.handle.subscribe();

        let (run, preempted) = accepted(&h.handle, UpdateTrigger::Manual).await;
        assert_eq!(preempted, None);

        let (finished, outcome) = next_finished(&mut events).await;
        assert_eq!(finished, run);
        assert!(matches!(outcome, RunOutcome::Applied { ref item_id, .. } if item_id == "p0"));

        let settings = h.store.snapshot();
        assert_eq!(settings.last_picked_index, 0);
        assert!(settings.last_successful_update.is_some());

        assert_eq!(h.sink.applied(), vec![(b"p0#1".to_vec(), FillMode::Stretch)]);
        assert_eq!(std::fs::read(&h.path).unwrap(), b"p0#1");

        let status = h.handle.status();
        assert_eq!(status.last_successful_update, settings.last_successful_update);
        assert_eq!(status.last_update_error, None);
        assert_eq!(status.in_flight, None);
    }

    #[tokio::test]
    async fn test_no_album_selected_reports_error() {
        let h = harness(Config::default(), FakePhotos::with_items(three_photos()));
        let mut events = h.handle.subscribe();

        accepted(&h.handle, UpdateTrigger::Manual).await;
        let (_, outcome) = next_finished(&mut events).await;

        assert_eq!(outcome, RunOutcome::Failed("No album selected".into()));
        assert_eq!(h.handle.status().last_update_error.as_deref(), Some("No album selected"));
        assert!(h.sink.applied().is_empty());
    }

    #[tokio::test]
    async fn test_everything_filtered_out_changes_nothing() {
        let photos = FakePhotos::with_items(vec![photo("small", 500, 400), photo("tall", 900, 1600)]);
        let config = Config { horizontal_only: true, ..album_config() };
        let h = harness(config, photos);
        let mut events = h.handle.subscribe();

        accepted(&h.handle, UpdateTrigger::Manual).await;
        let (_, outcome) = next_finished(&mut events).await;

        assert!(matches!(outcome, RunOutcome::Failed(_)));
        assert_eq!(h.store.snapshot().last_picked_index, -1);
        assert_eq!(h.photos.downloads.load(Ordering::SeqCst), 0);
        assert!(!h.path.exists());
    }

    #[tokio::test]
    async fn test_display_unavailable_is_not_success() {
        let sink = FakeSink { no_display: true, ..FakeSink::default() };
        let h = harness_with(album_config(), FakePhotos::with_items(three_photos()), sink);
        let mut events = h.handle.subscribe();

        accepted(&h.handle, UpdateTrigger::Manual).await;
        let (_, outcome) = next_finished(&mut events).await;

        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("No display")));
        assert_eq!(h.store.snapshot().last_successful_update, None);
        assert_eq!(h.handle.status().last_successful_update, None);
    }

    #[tokio::test]
    async fn test_manual_cancels_timer_run_after_fetch() {
        let photos = FakePhotos::with_items(three_photos());
        let timer_fetch = photos.gate_list();
        let h = harness(album_config(), photos);
        let mut events = h.handle.subscribe();

        let (timer_run, _) = accepted(&h.handle, UpdateTrigger::Timer).await;
        tokio::time::timeout(WAIT, timer_fetch.entered.notified()).await.unwrap();

        let (manual_run, preempted) = accepted(&h.handle, UpdateTrigger::Manual).await;
        assert_eq!(preempted, Some(timer_run));

        let (run, outcome) = next_finished(&mut events).await;
        assert_eq!(run, manual_run);
        assert!(matches!(outcome, RunOutcome::Applied { .. }));

        timer_fetch.release.notify_one();
        let (run, outcome) = next_finished(&mut events).await;
        assert_eq!(run, timer_run);
        assert_eq!(outcome, RunOutcome::Canceled);

        assert_eq!(h.photos.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.sink.applied().len(), 1);
        // The canceled run never reached selection.
        assert_eq!(h.store.snapshot().last_picked_index, 0);
    }

    #[tokio::test]
    async fn test_canceled_download_never_writes() {
        let photos = FakePhotos::with_items(three_photos());
        let timer_download = photos.gate_download();
        let h = harness(Config { pick_randomly: true, ..album_config() }, photos);
        let mut events = h.handle.subscribe();

        let (timer_run, _) = accepted(&h.handle, UpdateTrigger::Timer).await;
        tokio::time::timeout(WAIT, timer_download.entered.notified()).await.unwrap();

        let (manual_run, _) = accepted(&h.handle, UpdateTrigger::Manual).await;
        let (run, _) = next_finished(&mut events).await;
        assert_eq!(run, manual_run);
        let written = std::fs::read(&h.path).unwrap();
        assert!(written.ends_with(b"#2"));

        timer_download.release.notify_one();
        let (run, outcome) = next_finished(&mut events).await;
        assert_eq!(run, timer_run);
        assert_eq!(outcome, RunOutcome::Canceled);

        assert_eq!(std::fs::read(&h.path).unwrap(), written);
        assert_eq!(h.sink.applied().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_manual_request_wins() {
        let photos = FakePhotos::with_items(three_photos());
        let first_fetch = photos.gate_list();
        let h = harness(album_config(), photos);
        let mut events = h.handle.subscribe();

        let (first, _) = accepted(&h.handle, UpdateTrigger::Manual).await;
        tokio::time::timeout(WAIT, first_fetch.entered.notified()).await.unwrap();
        let (second, preempted) = accepted(&h.handle, UpdateTrigger::Manual).await;
        assert_eq!(preempted, Some(first));

        assert_eq!(next_finished(&mut events).await.0, second);
        first_fetch.release.notify_one();
        assert_eq!(next_finished(&mut events).await, (first, RunOutcome::Canceled));
    }

    #[tokio::test]
    async fn test_timer_requests_rejected_while_busy() {
        let photos = FakePhotos::with_items(three_photos());
        let manual_fetch = photos.gate_list();
        let h = harness(album_config(), photos);

        accepted(&h.handle, UpdateTrigger::Manual).await;
        tokio::time::timeout(WAIT, manual_fetch.entered.notified()).await.unwrap();
        assert_eq!(h.handle.request_update(UpdateTrigger::Timer).await.unwrap(), RequestOutcome::Rejected);
        manual_fetch.release.notify_one();

        let photos = FakePhotos::with_items(three_photos());
        let timer_fetch = photos.gate_list();
        let h = harness(album_config(), photos);

        accepted(&h.handle, UpdateTrigger::Timer).await;
        tokio::time::timeout(WAIT, timer_fetch.entered.notified()).await.unwrap();
        assert_eq!(h.handle.request_update(UpdateTrigger::Timer).await.unwrap(), RequestOutcome::Rejected);
        timer_fetch.release.notify_one();
    }

    #[tokio::test]
    async fn test_stale_completion_keeps_newer_run_tracked() {
        let photos = FakePhotos::with_items(three_photos());
        let timer_fetch = photos.gate_list();
        let manual_fetch = photos.gate_list();
        let h = harness(album_config(), photos);
        let mut events = h.handle.subscribe();

        let (timer_run, _) = accepted(&h.handle, UpdateTrigger::Timer).await;
        tokio::time::timeout(WAIT, timer_fetch.entered.notified()).await.unwrap();
        let (manual_run, _) = accepted(&h.handle, UpdateTrigger::Manual).await;
        tokio::time::timeout(WAIT, manual_fetch.entered.notified()).await.unwrap();

        timer_fetch.release.notify_one();
        assert_eq!(next_finished(&mut events).await, (timer_run, RunOutcome::Canceled));

        assert_eq!(h.handle.status().in_flight, Some(UpdateTrigger::Manual));
        assert_eq!(h.handle.request_update(UpdateTrigger::Timer).await.unwrap(), RequestOutcome::Rejected);

        manual_fetch.release.notify_one();
        let (run, outcome) = next_finished(&mut events).await;
        assert_eq!(run, manual_run);
        assert!(matches!(outcome, RunOutcome::Applied { .. }));
        assert_eq!(h.handle.status().in_flight, None);
    }

    #[tokio::test]
    async fn test_superseded_failure_reports_canceled() {
        let failing = FakePhotos { list_error: Some(503), ..FakePhotos::with_items(three_photos()) };
        let timer_fetch = failing.gate_list();
        let h = harness(album_config(), failing);
        let mut events = h.handle.subscribe();

        let (timer_run, _) = accepted(&h.handle, UpdateTrigger::Timer).await;
        tokio::time::timeout(WAIT, timer_fetch.entered.notified()).await.unwrap();

        let healthy = Arc::new(FakePhotos::with_items(three_photos()));
        let manual_fetch = healthy.gate_list();
        h.handle.reconfigure(healthy).unwrap();
        let (manual_run, preempted) = accepted(&h.handle, UpdateTrigger::Manual).await;
        assert_eq!(preempted, Some(timer_run));
        tokio::time::timeout(WAIT, manual_fetch.entered.notified()).await.unwrap();

        timer_fetch.release.notify_one();
        assert_eq!(next_finished(&mut events).await, (timer_run, RunOutcome::Canceled));
        let status = h.handle.status();
        assert_eq!(status.last_update_error, None);
        assert_eq!(status.in_flight, Some(UpdateTrigger::Manual));

        manual_fetch.release.notify_one();
        let (run, outcome) = next_finished(&mut events).await;
        assert_eq!(run, manual_run);
        assert!(matches!(outcome, RunOutcome::Applied { .. }));
        assert_eq!(h.handle.status().last_update_error, None);
    }

    #[tokio::test]
    async fn test_superseded_run_that_applied_records_success_without_scheduling() {
        let config = Config {
            last_successful_update: Some(Utc::now() - chrono::Duration::hours(1)),
            ..album_config()
        };
        let sink = FakeSink::default();
        let timer_apply = sink.gate_apply();
        let manual_apply = sink.gate_apply();
        let h = harness_with(config, FakePhotos::with_items(three_photos()), sink);
        let mut events = h.handle.subscribe();
        let mut status = h.handle.watch_status();
        h.handle.start().unwrap();
        status.wait_for(|s| s.next_scheduled_update.is_some()).await.unwrap();

        let (timer_run, _) = accepted(&h.handle, UpdateTrigger::Timer).await;
        tokio::time::timeout(WAIT, timer_apply.entered.notified()).await.unwrap();

        // The manual run waits behind the apply lock held by the timer run.
        let (manual_run, preempted) = accepted(&h.handle, UpdateTrigger::Manual).await;
        assert_eq!(preempted, Some(timer_run));
        assert_eq!(h.handle.status().next_scheduled_update, None);

        timer_apply.release.notify_one();
        let (run, outcome) = next_finished(&mut events).await;
        assert_eq!(run, timer_run);
        let RunOutcome::Applied { at, .. } = outcome else {
            panic!("superseded run did not apply: {outcome:?}");
        };
        let after_timer = h.handle.status();
        assert_eq!(after_timer.last_successful_update, Some(at));
        assert_eq!(after_timer.next_scheduled_update, None);
        assert_eq!(after_timer.in_flight, Some(UpdateTrigger::Manual));
        assert_eq!(h.store.snapshot().last_successful_update, Some(at));

        tokio::time::timeout(WAIT, manual_apply.entered.notified()).await.unwrap();
        assert_eq!(h.handle.status().next_scheduled_update, None);
        manual_apply.release.notify_one();
        let (run, outcome) = next_finished(&mut events).await;
        assert_eq!(run, manual_run);
        let RunOutcome::Applied { at: manual_at, .. } = outcome else {
            panic!("manual run did not apply: {outcome:?}");
        };
        let next = status
            .wait_for(|s| s.next_scheduled_update.is_some())
            .await
            .unwrap()
            .next_scheduled_update
            .unwrap();
        assert_eq!(next, manual_at + chrono::Duration::seconds(86_400));
        assert_eq!(h.sink.applied().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_after_delay() {
        let photos = FakePhotos { list_error: Some(503), ..FakePhotos::with_items(three_photos()) };
        let config = Config { last_successful_update: Some(Utc::now() - chrono::Duration::days(3)), ..album_config() };
        let h = harness(config, photos);
        let mut events = h.handle.subscribe();
        h.handle.start().unwrap();

        let before = Utc::now();
        accepted(&h.handle, UpdateTrigger::Manual).await;
        let (_, outcome) = next_finished(&mut events).await;
        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("503")));

        let status = h.handle.status();
        let next = status.next_scheduled_update.expect("retry scheduled");
        assert!(next >= before + chrono::Duration::seconds(300));
        assert!(status.last_update_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_start_and_stop_schedule() {
        let last = Utc::now() - chrono::Duration::seconds(90_000);
        let config = Config { last_successful_update: Some(last), ..album_config() };
        let h = harness(config, FakePhotos::with_items(three_photos()));
        let mut status = h.handle.watch_status();

        let before = Utc::now();
        h.handle.start().unwrap();
        let scheduled = status
            .wait_for(|s| s.next_scheduled_update.is_some())
            .await
            .unwrap()
            .clone();
        let after = Utc::now();
        let next = scheduled.next_scheduled_update.unwrap();
        assert!(next >= before + chrono::Duration::seconds(60));
        assert!(next <= after + chrono::Duration::seconds(60));
        assert!(scheduled.automatic_updates);

        h.handle.stop().unwrap();
        let stopped = status.wait_for(|s| !s.automatic_updates).await.unwrap().clone();
        assert_eq!(stopped.next_scheduled_update, None);
    }

    #[tokio::test]
    async fn test_manual_request_disarms_timer() {
        let photos = FakePhotos::with_items(three_photos());
        let fetch = photos.gate_list();
        let h = harness(album_config(), photos);
        let mut status = h.handle.watch_status();
        h.handle.start().unwrap();
        status.wait_for(|s| s.next_scheduled_update.is_some()).await.unwrap();

        accepted(&h.handle, UpdateTrigger::Manual).await;
        assert_eq!(h.handle.status().next_scheduled_update, None);

        fetch.release.notify_one();
        status.wait_for(|s| s.in_flight.is_none() && s.next_scheduled_update.is_some()).await.unwrap();
    }

    #[tokio::test]
    async fn test_settings_change_reschedules() {
        let h = harness(Config::default(), FakePhotos::with_items(three_photos()));
        let mut status = h.handle.watch_status();
        h.handle.start().unwrap();
        status.wait_for(|s| s.automatic_updates).await.unwrap();
        assert_eq!(h.handle.status().next_scheduled_update, None);

        h.store.set_selected_album(Some("album".into()), None).unwrap();
        h.handle.settings_changed().unwrap();
        status.wait_for(|s| s.next_scheduled_update.is_some()).await.unwrap();

        h.store.set_change_frequency(crate::config::ChangeFrequency::Never).unwrap();
        h.handle.settings_changed().unwrap();
        status.wait_for(|s| s.next_scheduled_update.is_none()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconfigure_swaps_photo_source() {
        let h = harness(album_config(), FakePhotos::with_items(three_photos()));
        let mut events = h.handle.subscribe();

        let replacement = Arc::new(FakePhotos::with_items(vec![photo("fresh", 5000, 3000)]));
        h.handle.reconfigure(replacement.clone()).unwrap();

        accepted(&h.handle, UpdateTrigger::Manual).await;
        let (_, outcome) = next_finished(&mut events).await;
        assert!(matches!(outcome, RunOutcome::Applied { ref item_id, .. } if item_id == "fresh"));
        assert_eq!(h.photos.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(replacement.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_timeout_fails_run() {
        let photos = FakePhotos::with_items(three_photos());
        let _stuck = photos.gate_list();
        let config = Config { network_timeout_secs: 1, ..album_config() };
        let h = harness(config, photos);
        let mut events = h.handle.subscribe();

        accepted(&h.handle, UpdateTrigger::Manual).await;
        let (_, outcome) = next_finished(&mut events).await;
        assert!(matches!(outcome, RunOutcome::Failed(ref m) if m.contains("1s")));
    }

    #[tokio::test]
    async fn test_verify_clears_missing_album() {
        let store = MemorySettingsStore::new(Config { selected_album_name: Some("Gone".into()), ..album_config() });
        let photos = FakePhotos { album_missing: true, ..FakePhotos::default() };
        verify_selected_album(&photos, &store).await;
        let settings = store.snapshot();
        assert_eq!(settings.album_id(), None);
        assert_eq!(settings.selected_album_name, None);

        let store = MemorySettingsStore::new(album_config());
        verify_selected_album(&FakePhotos::default(), &store).await;
        assert_eq!(store.snapshot().album_id(), Some("album"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_gives_up_on_stalled_lookup() {
        let store = MemorySettingsStore::new(Config { network_timeout_secs: 5, ..album_config() });
        let photos = FakePhotos { album_stalls: true, ..FakePhotos::default() };

        tokio::time::timeout(Duration::from_secs(60), verify_selected_album(&photos, &store))
            .await
            .expect("verification returned after the network timeout");
        assert_eq!(store.snapshot().album_id(), Some("album"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_scheduled_update() {
        let last = Utc::now() - chrono::Duration::seconds(90_000);
        let config = Config { last_successful_update: Some(last), ..album_config() };
        let h = harness(config, FakePhotos::with_items(three_photos()));
        let mut events = h.handle.subscribe();
        h.handle.start().unwrap();

        let started = tokio::time::timeout(Duration::from_secs(3600), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(started, UpdateEvent::Started { trigger: UpdateTrigger::Timer, .. }));

        let (_, outcome) = loop {
            let event = tokio::time::timeout(Duration::from_secs(3600), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let UpdateEvent::Finished { run, outcome, .. } = event {
                break (run, outcome);
            }
        };
        let RunOutcome::Applied { at, .. } = outcome else {
            panic!("timer run did not apply: {outcome:?}");
        };

        let mut status = h.handle.watch_status();
        let next = status
            .wait_for(|s| s.next_scheduled_update.is_some())
            .await
            .unwrap()
            .next_scheduled_update
            .unwrap();
        assert_eq!(next, at + chrono::Duration::seconds(86_400));
    }
}
