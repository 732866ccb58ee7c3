//! Application context: owns every engine component
//!
//! **Architecture**: one explicit context instead of globals. The interactive
//! thread holds `AppContext` by value; background work (loads, prefetch, lyric
//! checks, separation) reports back only through channels, drained by
//! [`AppContext::pump_events`].
//!
//! **Used by**: CLI commands, integration tests
//!
//! # Event flow
//!
//! ```text
//! select_track ──► Workers ──► AudioManager::load ──► AppEvent::TrackLoaded
//!      └─► PrefetchScheduler (audio / covers / lyrics of neighbours)
//! play / next / previous ──► Workers ──► Transport (stop, settle, load, start)
//!                                           └─► AppEvent::TrackLoaded / TrackLoadFailed
//! submit_separation ──► JobQueue ──► JobEvent ──► pump_events ──► AppEvent::Job
//!                                        └─ RescanRequested ──► Workers (discover)
//!                                                 └─► pump_events merges ──► LibraryScanned
//! maintenance_tick ──► MemoryPolicy::should_cleanup ──► evict in priority order
//! ```
//!
//! Transitions are ticketed: a queued transition that is no longer the latest
//! request is skipped, so rapid next/next/play ends on the last request.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::config::LoadingConfig;
use crate::core::{CacheStats, IntervalTicker, MemoryPolicy, MemoryReport, ResourceError, TaskHandle, Workers};
use crate::playback::{self, OutputSink, PlaybackState, Transport, TransportStatus};
use crate::playlist::{self, Discovery, PlaylistIndex, ScanReport};
use crate::resources::audio::log_load_error;
use crate::resources::{
    AudioManager, ImageManager, LyricsManager, LyricsProvider, LyricsRefresh, PrefetchScheduler, ResourceKind,
    StemSet,
};
use crate::separation::{
    DemucsPipeline, JobEvent, JobQueue, PipelineSettings, QueueSnapshot, SeparationJob, SeparationRunner, Verifier,
};

/// Results delivered to the interactive thread
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Stems of the selected track are ready
    TrackLoaded { index: usize, stems: Arc<StemSet> },
    TrackLoadFailed { index: usize, error: ResourceError },
    LibraryScanned { added: usize, total: usize, malformed: usize },
    LyricsRefreshed { folder: PathBuf, outcome: LyricsRefresh },
    /// Caches shrunk under memory pressure: (cache, entries evicted)
    MemoryCleanup { evicted: Vec<(ResourceKind, usize)> },
    Job(JobEvent),
}

/// Combined cache, memory and queue status
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub audio: CacheStats,
    pub images: CacheStats,
    pub icons: CacheStats,
    pub lyrics: CacheStats,
    pub memory: MemoryReport,
    pub queue: QueueSnapshot,
    pub tracks: usize,
}

pub struct AppContext {
    config: LoadingConfig,
    workers: Arc<Workers>,
    audio: Arc<AudioManager>,
    images: Arc<ImageManager>,
    lyrics: Arc<LyricsManager>,
    policy: Arc<MemoryPolicy>,
    prefetch: PrefetchScheduler,
    playlist: PlaylistIndex,
    transport: Arc<Mutex<Transport>>,
    status: TransportStatus,
    /// Ticket of the latest requested transition
    transition: Arc<AtomicU64>,
    pending_scan: Option<TaskHandle<Discovery>>,
    rescan_queued: bool,
    jobs: JobQueue,
    job_events: Receiver<JobEvent>,
    ticker: IntervalTicker,
    lyrics_provider: Option<Arc<dyn LyricsProvider>>,
    lyric_checks: Vec<(PathBuf, TaskHandle<LyricsRefresh>)>,
    selected: Option<usize>,
    tx: Sender<AppEvent>,
    rx: Receiver<AppEvent>,
}

impl AppContext {
    /// Context with the real process memory sampler and the external separation tool
    pub fn new(config: LoadingConfig, sink: Box<dyn OutputSink>) -> Self {
        let policy = MemoryPolicy::for_process(config.max_memory_usage_mb);
        let runner = Arc::new(DemucsPipeline::new(PipelineSettings::from(&config)));
        Self::with_parts(config, policy, runner, sink)
    }

    /// Context with explicit collaborators
    pub fn with_parts(
        config: LoadingConfig,
        policy: MemoryPolicy,
        runner: Arc<dyn SeparationRunner>,
        sink: Box<dyn OutputSink>,
    ) -> Self {
        // 75% of cores for background work, the rest for the interactive thread
        let workers = Arc::new(Workers::new(num_cpus::get() * 3 / 4));

        let audio = Arc::new(AudioManager::with_opener(
            config.audio_cache_size,
            config.max_concurrent_loads,
            config.load_timeout(),
            Arc::clone(&workers),
            Arc::new(crate::resources::FileOpener),
        ));
        let images = Arc::new(ImageManager::new(
            config.image_cache_size,
            config.icon_cache_size,
            Arc::clone(&workers),
        ));
        let lyrics = Arc::new(LyricsManager::new(config.lyrics_cache_size, Arc::clone(&workers)));
        let policy = Arc::new(policy);
        let prefetch = PrefetchScheduler::new(
            Arc::clone(&audio),
            Arc::clone(&images),
            Arc::clone(&lyrics),
            Arc::clone(&policy),
            &config,
        );

        let (job_tx, job_events) = crossbeam_channel::unbounded();
        let verifier = Verifier::new(config.verify_interval(), config.verify_max_attempts, job_tx.clone());
        let jobs = JobQueue::new(runner, verifier, job_tx);

        let transport = Transport::new(Arc::clone(&audio), sink, config.settle_delay());
        let status = transport.status();
        let ticker = IntervalTicker::new(config.cleanup_interval_ms);
        let (tx, rx) = crossbeam_channel::unbounded();

        info!(
            "AppContext initialized: library={}, workers={}",
            config.library_dir.display(),
            workers.num_threads()
        );

        Self {
            config,
            workers,
            audio,
            images,
            lyrics,
            policy,
            prefetch,
            playlist: PlaylistIndex::new(),
            transport: Arc::new(Mutex::new(transport)),
            status,
            transition: Arc::new(AtomicU64::new(0)),
            pending_scan: None,
            rescan_queued: false,
            jobs,
            job_events,
            ticker,
            lyrics_provider: None,
            lyric_checks: Vec::new(),
            selected: None,
            tx,
            rx,
        }
    }

    /// Enable lyric freshness checks after each scan
    pub fn with_lyrics_provider(mut self, provider: Arc<dyn LyricsProvider>) -> Self {
        self.lyrics_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &LoadingConfig {
        &self.config
    }

    pub fn playlist(&self) -> &PlaylistIndex {
        &self.playlist
    }

    pub fn audio(&self) -> &Arc<AudioManager> {
        &self.audio
    }

    pub fn images(&self) -> &Arc<ImageManager> {
        &self.images
    }

    pub fn lyrics(&self) -> &Arc<LyricsManager> {
        &self.lyrics
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.workers
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// Receiver side of the result channel
    pub fn events(&self) -> &Receiver<AppEvent> {
        &self.rx
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Scan the library directory and queue lyric checks for every track found
    pub fn scan_library(&mut self) -> ScanReport {
        let root = self.config.library_dir.clone();
        self.scan(&root)
    }

    /// Scan `root` on the calling thread; for startup and explicit refreshes
    pub fn scan(&mut self, root: &Path) -> ScanReport {
        let report = self.playlist.scan(root);
        self.after_scan(&report);
        report
    }

    /// True while a background rescan is running or queued
    pub fn is_scanning(&self) -> bool {
        self.pending_scan.is_some() || self.rescan_queued
    }

    /// Walk the library on the worker pool; `pump_events` merges the result
    fn request_rescan(&mut self) {
        if self.pending_scan.is_some() {
            self.rescan_queued = true;
            return;
        }
        let root = self.config.library_dir.clone();
        debug!("Background rescan of {}", root.display());
        self.pending_scan = Some(self.workers.spawn(move || playlist::discover(&root)));
    }

    fn after_scan(&mut self, report: &ScanReport) {
        if let Some(provider) = &self.lyrics_provider {
            for track in &report.found {
                let handle = self.lyrics.refresh_async(Arc::clone(provider), track.clone());
                self.lyric_checks.push((track.folder.clone(), handle));
            }
            debug!("Queued {} lyric checks", report.found.len());
        }

        self.emit(AppEvent::LibraryScanned {
            added: report.added.len(),
            total: self.playlist.len(),
            malformed: report.malformed.len(),
        });
    }

    /// Load track `index` in the background and warm its neighbours.
    ///
    /// The result arrives as `TrackLoaded` / `TrackLoadFailed`. Returns false
    /// if `index` is out of range.
    pub fn select_track(&mut self, index: usize) -> bool {
        let Some(track) = self.playlist.get(index) else {
            warn!("select_track: no track at {}", index);
            return false;
        };
        self.selected = Some(index);

        let folder = track.folder.clone();
        let audio = Arc::clone(&self.audio);
        let tx = self.tx.clone();
        self.workers.execute(move || {
            let event = match audio.load(&folder) {
                Ok(Some(stems)) => AppEvent::TrackLoaded { index, stems },
                Ok(None) => AppEvent::TrackLoadFailed {
                    index,
                    error: ResourceError::load("no stems"),
                },
                Err(error) => {
                    log_load_error(&folder, &error);
                    AppEvent::TrackLoadFailed { index, error }
                }
            };
            let _ = tx.send(event);
        });

        self.prefetch.on_track_selected(&self.playlist.folders(), index);
        true
    }

    /// Play track `index`: stop, settle, load and start on the worker pool.
    ///
    /// The result arrives as `TrackLoaded` / `TrackLoadFailed`. Returns false
    /// if `index` is out of range.
    pub fn play(&mut self, index: usize) -> bool {
        let Some(track) = self.playlist.get(index).cloned() else {
            warn!("play: no track at {}", index);
            return false;
        };
        self.selected = Some(index);

        let ticket = self.next_ticket();
        let latest = Arc::clone(&self.transition);
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        self.workers.execute(move || {
            let mut transport = lock_transport(&transport);
            if latest.load(Ordering::SeqCst) != ticket {
                debug!("Skipping superseded transition to {}", index);
                return;
            }
            let event = match transport.play_track(index, &track) {
                Ok(stems) => AppEvent::TrackLoaded { index, stems },
                Err(error) => {
                    log_load_error(&track.folder, &error);
                    AppEvent::TrackLoadFailed { index, error }
                }
            };
            let _ = tx.send(event);
        });

        self.prefetch.on_track_selected(&self.playlist.folders(), index);
        true
    }

    /// Next track, wrapping to the first
    pub fn next(&mut self) -> bool {
        let index = playback::next_index(self.selected, self.playlist.len());
        self.play(index)
    }

    /// Previous track, wrapping to the last
    pub fn previous(&mut self) -> bool {
        let index = playback::previous_index(self.selected, self.playlist.len());
        self.play(index)
    }

    /// Stop output on the worker pool; cancels transitions still queued
    pub fn stop(&mut self) {
        let ticket = self.next_ticket();
        let latest = Arc::clone(&self.transition);
        let transport = Arc::clone(&self.transport);
        self.workers.execute(move || {
            let mut transport = lock_transport(&transport);
            if latest.load(Ordering::SeqCst) == ticket {
                transport.stop();
            }
        });
    }

    /// Direct transport access for mixing; blocks while a transition runs
    pub fn transport(&self) -> &Arc<Mutex<Transport>> {
        &self.transport
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.status.state()
    }

    fn next_ticket(&self) -> u64 {
        self.transition.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue a separation of `source` into `<library>/<artist>/<title>`
    pub fn submit_separation(&self, artist: &str, title: &str, source: impl Into<PathBuf>) -> Uuid {
        let job = SeparationJob::new(artist, title, source);
        info!("Submitting separation: {}", job.display_name());
        self.jobs.submit(job)
    }

    /// Shift the lyrics of track `index` by `offset` seconds
    pub fn adjust_lyrics(&self, index: usize, offset: f64) -> Result<usize, ResourceError> {
        let track = self
            .playlist
            .get(index)
            .ok_or_else(|| ResourceError::load(format!("No track at index {}", index)))?;
        self.lyrics.adjust_timing(&track.folder, offset)
    }

    /// Drain background results: forward job events, rescan on request,
    /// collect finished lyric checks. Returns the number of events handled.
    pub fn pump_events(&mut self) -> usize {
        let mut handled = 0;
        let mut rescan = false;

        while let Ok(event) = self.job_events.try_recv() {
            handled += 1;
            match &event {
                JobEvent::RescanRequested => rescan = true,
                JobEvent::Finished { folder, .. } | JobEvent::Verified { folder, .. } => {
                    // Cover and lyrics may have appeared with the new stems
                    self.images.invalidate(folder);
                    self.lyrics.invalidate(folder);
                    self.audio.remove(folder);
                }
                _ => {}
            }
            self.emit(AppEvent::Job(event));
        }

        // Several completions in one pump collapse into a single scan
        if rescan {
            self.request_rescan();
        }

        let finished = self.pending_scan.as_ref().and_then(TaskHandle::try_join);
        if let Some(result) = finished {
            self.pending_scan = None;
            match result {
                Ok(discovery) => {
                    handled += 1;
                    let report = self.playlist.merge(discovery);
                    self.after_scan(&report);
                }
                Err(e) => warn!("Library rescan dropped: {:?}", e),
            }
            if std::mem::take(&mut self.rescan_queued) {
                self.request_rescan();
            }
        }

        let mut pending = Vec::with_capacity(self.lyric_checks.len());
        for (folder, handle) in self.lyric_checks.drain(..) {
            match handle.try_join() {
                None => pending.push((folder, handle)),
                Some(Ok(outcome)) => {
                    handled += 1;
                    if outcome != LyricsRefresh::Fresh {
                        self.lyrics.invalidate(&folder);
                    }
                    let _ = self.tx.send(AppEvent::LyricsRefreshed { folder, outcome });
                }
                Some(Err(e)) => warn!("Lyric check for {} dropped: {:?}", folder.display(), e),
            }
        }
        self.lyric_checks = pending;

        handled
    }

    /// True while lyric checks are still running
    pub fn has_pending_lyric_checks(&self) -> bool {
        !self.lyric_checks.is_empty()
    }

    /// Periodic housekeeping; runs at most once per `cleanup_interval_ms`
    pub fn maintenance_tick(&mut self) -> Option<Vec<(ResourceKind, usize)>> {
        if !self.ticker.tick() {
            return None;
        }
        self.tune_capacities();
        self.cleanup_memory()
    }

    /// Sample memory and, if over budget, evict caches in priority order
    /// until usage is back under the threshold.
    pub fn cleanup_memory(&mut self) -> Option<Vec<(ResourceKind, usize)>> {
        self.policy.sample();
        if !self.policy.should_cleanup() {
            return None;
        }

        let priority = self.policy.cleanup_priority();
        info!(
            "Memory cleanup: {:.0} MB of {:.0} MB, order {:?}",
            self.policy.usage_mb(),
            self.policy.ceiling_mb(),
            priority
        );

        let mut evicted = Vec::new();
        for kind in priority {
            let count = self.evict(kind);
            evicted.push((kind, count));

            self.policy.sample();
            if !self.policy.should_cleanup() {
                break;
            }
        }

        self.emit(AppEvent::MemoryCleanup {
            evicted: evicted.clone(),
        });
        Some(evicted)
    }

    fn evict(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Audio => {
                let current = self.selected.and_then(|i| self.playlist.get(i)).map(|t| t.folder.clone());
                match current {
                    Some(folder) => self.audio.cleanup_old(&folder, self.config.audio_keep_on_cleanup),
                    None => {
                        let size = self.audio.stats().size;
                        self.audio.clear();
                        size
                    }
                }
            }
            ResourceKind::Image => {
                let size = self.images.stats().size;
                self.images.clear();
                size
            }
            ResourceKind::Lyrics => {
                let size = self.lyrics.stats().size;
                self.lyrics.clear();
                size
            }
        }
    }

    /// Grow caches with slow loads, shrink caches with fast ones.
    ///
    /// Suggestions start from the configured size, so repeated ticks with the
    /// same load times settle on one value instead of compounding.
    fn tune_capacities(&self) {
        let audio = self.audio.stats();
        let target = self.tuned_capacity(self.config.audio_cache_size, audio.avg_load_time);
        if target != audio.capacity {
            debug!("Audio cache capacity {} -> {}", audio.capacity, target);
            self.audio.set_capacity(target);
        }

        let images = self.images.stats();
        let target = self.tuned_capacity(self.config.image_cache_size, images.avg_load_time);
        if target != images.capacity {
            debug!("Image cache capacity {} -> {}", images.capacity, target);
            self.images.set_capacity(target);
        }
    }

    /// Suggested capacity, kept within half to double of `configured`
    fn tuned_capacity(&self, configured: usize, avg_load_time: Duration) -> usize {
        let configured = configured.max(1);
        self.policy
            .suggest_capacity(configured, avg_load_time)
            .clamp((configured / 2).max(1), configured * 2)
    }

    pub fn cache_report(&self) -> CacheReport {
        CacheReport {
            audio: self.audio.stats(),
            images: self.images.stats(),
            icons: self.images.icon_stats(),
            lyrics: self.lyrics.stats(),
            memory: self.policy.report(),
            queue: self.jobs.snapshot(),
            tracks: self.playlist.len(),
        }
    }

    /// Stop playback, drop pending jobs and wait for the running one
    pub fn shutdown(&mut self) {
        info!("AppContext shutting down");
        self.next_ticket();
        lock_transport(&self.transport).stop();
        self.jobs.shutdown();
        if !self.workers.wait_idle(Duration::from_secs(5)) {
            warn!("Background tasks still running at shutdown");
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }
}

fn lock_transport(transport: &Mutex<Transport>) -> MutexGuard<'_, Transport> {
    transport.lock().unwrap_or_else(|e| e.into_inner())
}
