//! Resource managers: audio stems, cover art and lyrics on top of `KeyedCache`
//!
//! Each manager owns one cache keyed by [`ResourceKey`] and pushes its
//! preloading onto the shared worker pool. Preloaders take a snapshot of track
//! folders so they never hold a reference into the playlist.

pub mod audio;
pub mod image;
pub mod lyrics;
pub mod prefetch;

use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};

pub use audio::{AudioManager, FileOpener, Stem, StemHandle, StemOpener, StemSet};
pub use self::image::{CoverImage, CoverSource, ImageManager};
pub use lyrics::{LrcDirectory, LyricLine, LyricsManager, LyricsProvider, LyricsRefresh};
pub use prefetch::PrefetchScheduler;

pub use crate::core::ResourceKind;

/// Cache key: identical requests (same kind, path and target size) share one entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub path: PathBuf,
    pub size: Option<(u32, u32)>,
}

impl ResourceKey {
    pub fn audio(folder: &Path) -> Self {
        Self {
            kind: ResourceKind::Audio,
            path: folder.to_path_buf(),
            size: None,
        }
    }

    pub fn image(path: &Path, size: (u32, u32)) -> Self {
        Self {
            kind: ResourceKind::Image,
            path: path.to_path_buf(),
            size: Some(size),
        }
    }

    pub fn lyrics(folder: &Path) -> Self {
        Self {
            kind: ResourceKind::Lyrics,
            path: folder.to_path_buf(),
            size: None,
        }
    }
}

/// Counting permit pool built on a bounded channel.
///
/// The channel starts full; `acquire` takes a token and the returned guard
/// puts it back on drop.
#[derive(Clone)]
pub struct LoadPermits {
    tx: Sender<()>,
    rx: Receiver<()>,
    limit: usize,
}

/// Held while a permit is in use
pub struct Permit {
    tx: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.tx.try_send(());
    }
}

impl LoadPermits {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        let (tx, rx) = crossbeam_channel::bounded(limit);
        for _ in 0..limit {
            let _ = tx.try_send(());
        }
        Self { tx, rx, limit }
    }

    /// Block until a permit is free
    pub fn acquire(&self) -> Permit {
        // Both ends live in self, so recv only fails if the pool is gone
        let _ = self.rx.recv();
        Permit { tx: self.tx.clone() }
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Indices at `offsets` from `current`, wrapping, without `current` or duplicates
pub(crate) fn neighbor_indices(len: usize, current: usize, offsets: impl IntoIterator<Item = isize>) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for offset in offsets {
        let idx = (current as isize + offset).rem_euclid(len as isize) as usize;
        if idx != current % len && !out.contains(&idx) {
            out.push(idx);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_keys_distinguish_size() {
        let p = Path::new("/music/a/b");
        assert_ne!(ResourceKey::image(p, (500, 500)), ResourceKey::image(p, (64, 64)));
        assert_ne!(ResourceKey::audio(p), ResourceKey::lyrics(p));
        assert_eq!(ResourceKey::audio(p), ResourceKey::audio(&p.to_path_buf()));
    }

    #[test]
    fn test_neighbor_indices_wrap() {
        assert_eq!(neighbor_indices(5, 4, 1..=2), vec![0, 1]);
        assert_eq!(neighbor_indices(5, 0, [-1, 1]), vec![4, 1]);
        // Tiny playlist: neighbours collapse, current is never included
        assert_eq!(neighbor_indices(2, 0, [-1, 1, 2]), vec![1]);
        assert!(neighbor_indices(1, 0, [-1, 1]).is_empty());
        assert!(neighbor_indices(0, 0, [1]).is_empty());
    }

    #[test]
    fn test_permits_bound_concurrency() {
        let permits = LoadPermits::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let permits = permits.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _permit = permits.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(permits.available(), 2);
    }
}
