//! Audio stem manager
//!
//! A track is playable once its folder holds all four stems under
//! `separated/`. Loading validates the set, then opens each stem through a
//! [`StemOpener`] (the external audio engine in the app, plain file reads by
//! default). Opens are bounded by a permit pool shared with the preloader.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};

use super::{LoadPermits, ResourceKey};
use crate::core::{CacheStats, KeyedCache, LoadResult, ResourceError, Workers};

/// Subfolder holding the separated stems
pub const SEPARATED_DIR: &str = "separated";

/// One of the four separated sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stem {
    Drums,
    Vocals,
    Bass,
    Other,
}

impl Stem {
    /// Playback order
    pub const ALL: [Stem; 4] = [Stem::Drums, Stem::Vocals, Stem::Bass, Stem::Other];

    pub fn name(self) -> &'static str {
        match self {
            Stem::Drums => "drums",
            Stem::Vocals => "vocals",
            Stem::Bass => "bass",
            Stem::Other => "other",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.mp3", self.name())
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Path of every stem of a track folder, in playback order
pub fn stem_paths(folder: &Path) -> [PathBuf; 4] {
    let dir = folder.join(SEPARATED_DIR);
    Stem::ALL.map(|s| dir.join(s.file_name()))
}

/// File names of stems absent from `folder/separated/`
pub fn missing_stems(folder: &Path) -> Vec<String> {
    Stem::ALL
        .iter()
        .zip(stem_paths(folder))
        .filter(|(_, path)| !path.is_file())
        .map(|(stem, _)| stem.file_name())
        .collect()
}

/// Opened stem, ready for the output engine
#[derive(Clone, PartialEq)]
pub struct StemHandle {
    pub stem: Stem,
    pub path: PathBuf,
    pub data: Arc<Vec<u8>>,
}

impl fmt::Debug for StemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StemHandle")
            .field("stem", &self.stem)
            .field("path", &self.path)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Four opened stems of one track, in [`Stem::ALL`] order
#[derive(Debug, Clone)]
pub struct StemSet {
    pub folder: PathBuf,
    pub stems: [StemHandle; 4],
}

impl StemSet {
    pub fn get(&self, stem: Stem) -> &StemHandle {
        &self.stems[stem as usize]
    }

    pub fn total_bytes(&self) -> usize {
        self.stems.iter().map(|s| s.data.len()).sum()
    }
}

/// Opens a stem file into something the output engine can play
pub trait StemOpener: Send + Sync {
    fn open(&self, stem: Stem, path: &Path) -> Result<StemHandle, ResourceError>;
}

/// Reads the whole stem into memory
#[derive(Debug, Default, Clone, Copy)]
pub struct FileOpener;

impl StemOpener for FileOpener {
    fn open(&self, stem: Stem, path: &Path) -> Result<StemHandle, ResourceError> {
        let data = std::fs::read(path)
            .map_err(|e| ResourceError::load(format!("{}: {}", path.display(), e)))?;
        Ok(StemHandle {
            stem,
            path: path.to_path_buf(),
            data: Arc::new(data),
        })
    }
}

/// Cloneable load path shared by `load` and the preloader task
#[derive(Clone)]
struct StemLoader {
    cache: Arc<KeyedCache<ResourceKey, StemSet>>,
    opener: Arc<dyn StemOpener>,
    permits: LoadPermits,
}

impl StemLoader {
    fn load(&self, folder: &Path) -> LoadResult<Arc<StemSet>> {
        let key = ResourceKey::audio(folder);
        let folder = folder.to_path_buf();
        let opener = Arc::clone(&self.opener);
        let permits = self.permits.clone();

        self.cache.get(&key, move || {
            let missing = missing_stems(&folder);
            if !missing.is_empty() {
                return Err(ResourceError::Missing {
                    path: folder.join(SEPARATED_DIR),
                    missing,
                });
            }

            let _permit = permits.acquire();
            let [drums, vocals, bass, other] = stem_paths(&folder);
            let stems = [
                opener.open(Stem::Drums, &drums)?,
                opener.open(Stem::Vocals, &vocals)?,
                opener.open(Stem::Bass, &bass)?,
                opener.open(Stem::Other, &other)?,
            ];
            debug!("Opened stems for {}", folder.display());
            Ok(Some(StemSet { folder, stems }))
        })
    }
}

/// Audio cache plus next-track preloader
pub struct AudioManager {
    loader: StemLoader,
    workers: Arc<Workers>,
    preloading: Arc<AtomicBool>,
}

impl AudioManager {
    pub fn new(capacity: usize, max_concurrent_loads: usize, workers: Arc<Workers>) -> Self {
        Self::with_opener(capacity, max_concurrent_loads, None, workers, Arc::new(FileOpener))
    }

    pub fn with_opener(
        capacity: usize,
        max_concurrent_loads: usize,
        load_timeout: Option<Duration>,
        workers: Arc<Workers>,
        opener: Arc<dyn StemOpener>,
    ) -> Self {
        info!(
            "AudioManager: capacity={}, concurrent loads={}",
            capacity, max_concurrent_loads
        );
        Self {
            loader: StemLoader {
                cache: Arc::new(KeyedCache::new("audio", capacity).with_load_timeout(load_timeout)),
                opener,
                permits: LoadPermits::new(max_concurrent_loads),
            },
            workers,
            preloading: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load the stems of a track folder (blocking; call from a worker)
    pub fn load(&self, folder: &Path) -> LoadResult<Arc<StemSet>> {
        self.loader.load(folder)
    }

    /// Warm the next `count` tracks after `current` (wrapping) in the background.
    ///
    /// Returns false if a preload pass is already running.
    pub fn preload_next(&self, folders: Vec<PathBuf>, current: usize, count: usize) -> bool {
        if count == 0 || folders.len() < 2 {
            return false;
        }
        if self.preloading.swap(true, Ordering::SeqCst) {
            debug!("Audio preload already running, skipping");
            return false;
        }

        let loader = self.loader.clone();
        let flag = Arc::clone(&self.preloading);
        self.workers.execute(move || {
            let _reset = FlagReset(flag);
            for idx in super::neighbor_indices(folders.len(), current, 1..=count as isize) {
                let folder = &folders[idx];
                if loader.cache.contains(&ResourceKey::audio(folder)) {
                    continue;
                }
                match loader.load(folder) {
                    Ok(_) => debug!("Preloaded audio: {}", folder.display()),
                    Err(e) => debug!("Audio preload skipped {}: {}", folder.display(), e),
                }
            }
        });
        true
    }

    pub fn is_preloading(&self) -> bool {
        self.preloading.load(Ordering::SeqCst)
    }

    /// Keep the current track plus the `keep_count - 1` most recently used entries
    pub fn cleanup_old(&self, current: &Path, keep_count: usize) -> usize {
        let evicted = self.loader.cache.retain_recent(&ResourceKey::audio(current), keep_count);
        if evicted > 0 {
            info!("Audio cleanup: evicted {} tracks", evicted);
        }
        evicted
    }

    pub fn contains(&self, folder: &Path) -> bool {
        self.loader.cache.contains(&ResourceKey::audio(folder))
    }

    pub fn remove(&self, folder: &Path) -> bool {
        self.loader.cache.remove(&ResourceKey::audio(folder))
    }

    pub fn clear(&self) {
        self.loader.cache.clear();
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.loader.cache.set_capacity(capacity);
    }

    pub fn stats(&self) -> CacheStats {
        self.loader.cache.get_stats()
    }

    pub fn permits(&self) -> &LoadPermits {
        &self.loader.permits
    }
}

/// Clears the in-progress flag when the preload task ends (even on panic)
struct FlagReset(Arc<AtomicBool>);

impl Drop for FlagReset {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for AudioManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioManager")
            .field("cache", &self.loader.cache)
            .field("preloading", &self.is_preloading())
            .finish_non_exhaustive()
    }
}

/// Warn once per folder that cannot be played; used by callers that only log
pub fn log_load_error(folder: &Path, err: &ResourceError) {
    match err {
        ResourceError::Missing { missing, .. } => {
            warn!("{}: stems not separated yet ({})", folder.display(), missing.join(", "))
        }
        other => warn!("{}: {}", folder.display(), other),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Create `root/<name>/separated/*.mp3` with small fake stems
    pub(crate) fn make_track(root: &Path, name: &str) -> PathBuf {
        let folder = root.join(name);
        let separated = folder.join(SEPARATED_DIR);
        std::fs::create_dir_all(&separated).unwrap();
        for stem in Stem::ALL {
            std::fs::write(separated.join(stem.file_name()), stem.name().as_bytes()).unwrap();
        }
        folder
    }

    struct CountingOpener {
        opens: AtomicUsize,
    }

    impl StemOpener for CountingOpener {
        fn open(&self, stem: Stem, path: &Path) -> Result<StemHandle, ResourceError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            FileOpener.open(stem, path)
        }
    }

    #[test]
    fn test_load_opens_four_stems_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = make_track(tmp.path(), "song");
        let manager = AudioManager::new(4, 2, Arc::new(Workers::new(1)));

        let set = manager.load(&folder).unwrap().unwrap();
        let names: Vec<_> = set.stems.iter().map(|s| s.stem).collect();
        assert_eq!(names, Stem::ALL.to_vec());
        assert_eq!(&**set.get(Stem::Bass).data, b"bass");
        assert!(manager.contains(&folder));
    }

    #[test]
    fn test_missing_stems_listed_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = make_track(tmp.path(), "song");
        std::fs::remove_file(folder.join("separated/vocals.mp3")).unwrap();
        std::fs::remove_file(folder.join("separated/other.mp3")).unwrap();

        let manager = AudioManager::new(4, 2, Arc::new(Workers::new(1)));
        match manager.load(&folder) {
            Err(ResourceError::Missing { missing, .. }) => {
                assert_eq!(missing, vec!["vocals.mp3".to_string(), "other.mp3".to_string()]);
            }
            other => panic!("expected Missing, got {:?}", other.map(|_| ())),
        }
        assert!(!manager.contains(&folder));
    }

    #[test]
    fn test_second_load_hits_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = make_track(tmp.path(), "song");
        let opener = Arc::new(CountingOpener {
            opens: AtomicUsize::new(0),
        });
        let manager = AudioManager::with_opener(4, 2, None, Arc::new(Workers::new(1)), opener.clone());

        manager.load(&folder).unwrap();
        manager.load(&folder).unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 4);
        assert_eq!(manager.stats().hits, 1);
    }

    #[test]
    fn test_preload_next_wraps() {
        let tmp = tempfile::tempdir().unwrap();
        let folders: Vec<_> = (0..4).map(|i| make_track(tmp.path(), &format!("t{}", i))).collect();
        let workers = Arc::new(Workers::new(2));
        let manager = AudioManager::new(10, 2, Arc::clone(&workers));

        assert!(manager.preload_next(folders.clone(), 3, 2));
        assert!(workers.wait_idle(Duration::from_secs(5)));

        assert!(manager.contains(&folders[0]));
        assert!(manager.contains(&folders[1]));
        assert!(!manager.contains(&folders[2]));
        assert!(!manager.contains(&folders[3]));
        assert!(!manager.is_preloading());
    }

    #[test]
    fn test_preload_skips_unplayable_tracks() {
        let tmp = tempfile::tempdir().unwrap();
        let good = make_track(tmp.path(), "good");
        let bare = tmp.path().join("bare");
        std::fs::create_dir_all(&bare).unwrap();
        let current = make_track(tmp.path(), "current");

        let workers = Arc::new(Workers::new(1));
        let manager = AudioManager::new(10, 2, Arc::clone(&workers));
        manager.preload_next(vec![current, bare.clone(), good.clone()], 0, 2);
        assert!(workers.wait_idle(Duration::from_secs(5)));

        assert!(!manager.contains(&bare));
        assert!(manager.contains(&good));
    }

    #[test]
    fn test_cleanup_old_keeps_current() {
        let tmp = tempfile::tempdir().unwrap();
        let folders: Vec<_> = (0..5).map(|i| make_track(tmp.path(), &format!("t{}", i))).collect();
        let manager = AudioManager::new(10, 2, Arc::new(Workers::new(1)));
        for f in &folders {
            manager.load(f).unwrap();
        }

        let evicted = manager.cleanup_old(&folders[0], 2);
        assert_eq!(evicted, 3);
        assert!(manager.contains(&folders[0]));
        assert!(manager.contains(&folders[4]));
    }
}
