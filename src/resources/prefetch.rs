//! Prefetch after track selection
//!
//! **Why**: the next track should start instantly; its stems, cover and lyrics
//! are warmed while the current one plays.
//!
//! **Used by**: AppContext::select_track and play
//!
//! How much is warmed depends on memory pressure: [`MemoryPolicy::preload_plan`]
//! trims the audio look-ahead and skips covers when usage is high.

use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use super::{AudioManager, ImageManager, LyricsManager};
use crate::config::LoadingConfig;
use crate::core::{MemoryPolicy, PreloadPlan};

/// Prefetch settings taken from `LoadingConfig`
#[derive(Debug, Clone, Copy)]
struct PrefetchSettings {
    preload_next_songs: usize,
    lyrics_radius: usize,
    preload_covers: bool,
    cover_size: (u32, u32),
}

pub struct PrefetchScheduler {
    audio: Arc<AudioManager>,
    images: Arc<ImageManager>,
    lyrics: Arc<LyricsManager>,
    policy: Arc<MemoryPolicy>,
    settings: PrefetchSettings,
}

impl PrefetchScheduler {
    pub fn new(
        audio: Arc<AudioManager>,
        images: Arc<ImageManager>,
        lyrics: Arc<LyricsManager>,
        policy: Arc<MemoryPolicy>,
        config: &LoadingConfig,
    ) -> Self {
        Self {
            audio,
            images,
            lyrics,
            policy,
            settings: PrefetchSettings {
                preload_next_songs: config.preload_next_songs,
                lyrics_radius: config.lyrics_preload_radius,
                preload_covers: config.preload_covers,
                cover_size: config.cover_size,
            },
        }
    }

    /// Warm neighbours of `current` in `folders`. Returns the plan used.
    pub fn on_track_selected(&self, folders: &[PathBuf], current: usize) -> PreloadPlan {
        let plan = self
            .policy
            .preload_plan(self.settings.preload_next_songs, folders.len(), current);
        debug!("Prefetch around {} / {}: {:?}", current, folders.len(), plan);

        if folders.len() < 2 {
            return plan;
        }

        if plan.audio && plan.count > 0 {
            self.audio.preload_next(folders.to_vec(), current, plan.count);
        }
        if plan.covers && self.settings.preload_covers {
            self.images
                .preload_covers(folders.to_vec(), current, self.settings.cover_size);
        }
        if plan.lyrics && self.settings.lyrics_radius > 0 {
            self.lyrics
                .preload(folders.to_vec(), current, self.settings.lyrics_radius);
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Workers;
    use crate::core::memory::tests::Scripted;
    use crate::resources::audio::tests::make_track;
    use crate::resources::lyrics::LYRICS_FILE;
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        folders: Vec<PathBuf>,
        workers: Arc<Workers>,
        audio: Arc<AudioManager>,
        images: Arc<ImageManager>,
        lyrics: Arc<LyricsManager>,
        scheduler: PrefetchScheduler,
    }

    fn fixture(usage_mb: f64, ceiling_mb: u64) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let folders: Vec<PathBuf> = (0..5)
            .map(|i| {
                let folder = make_track(tmp.path(), &format!("t{}", i));
                std::fs::write(folder.join(LYRICS_FILE), "[00:01.00]x\n").unwrap();
                folder
            })
            .collect();

        let workers = Arc::new(Workers::new(2));
        let audio = Arc::new(AudioManager::new(10, 2, Arc::clone(&workers)));
        let images = Arc::new(ImageManager::new(10, 4, Arc::clone(&workers)));
        let lyrics = Arc::new(LyricsManager::new(10, Arc::clone(&workers)));
        let policy = Arc::new(MemoryPolicy::new(ceiling_mb, Box::new(Scripted::new(&[usage_mb]))));
        policy.sample();

        let scheduler = PrefetchScheduler::new(
            Arc::clone(&audio),
            Arc::clone(&images),
            Arc::clone(&lyrics),
            policy,
            &LoadingConfig::default(),
        );
        Fixture {
            _tmp: tmp,
            folders,
            workers,
            audio,
            images,
            lyrics,
            scheduler,
        }
    }

    #[test]
    fn test_relaxed_memory_warms_everything() {
        let f = fixture(10.0, 512);

        let plan = f.scheduler.on_track_selected(&f.folders, 0);
        assert_eq!(plan.count, 2);
        assert!(f.workers.wait_idle(Duration::from_secs(5)));

        assert!(f.audio.contains(&f.folders[1]));
        assert!(f.audio.contains(&f.folders[2]));
        assert!(!f.audio.contains(&f.folders[3]));
        assert!(f.lyrics.contains(&f.folders[4]));
        assert!(f.lyrics.contains(&f.folders[1]));
        // No art in the folders: defaults are not cached
        assert!(!f.images.contains_cover(&f.folders[1], (500, 500)));
    }

    #[test]
    fn test_pressure_trims_preload() {
        let f = fixture(480.0, 512);

        let plan = f.scheduler.on_track_selected(&f.folders, 0);
        assert_eq!(plan.count, 1);
        assert!(!plan.covers);
        assert!(f.workers.wait_idle(Duration::from_secs(5)));

        assert!(f.audio.contains(&f.folders[1]));
        assert!(!f.audio.contains(&f.folders[2]));
    }

    #[test]
    fn test_single_track_does_nothing() {
        let f = fixture(10.0, 512);
        let plan = f.scheduler.on_track_selected(&f.folders[..1], 0);
        assert_eq!(plan.count, 0);
        assert!(f.workers.wait_idle(Duration::from_secs(5)));
        assert_eq!(f.audio.stats().size, 0);
    }
}
