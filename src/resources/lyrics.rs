//! Synchronized lyrics: `.lrc` parsing, timing shifts and freshness checks
//!
//! File format: a `[mm:ss.cc]` prefix starts a block; following non-blank
//! lines without a prefix belong to the same block (joined with `\n`).
//! The first block is a title header written by [`write_lyrics_file`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;

use super::{neighbor_indices, ResourceKey};
use crate::core::{CacheStats, KeyedCache, ResourceError, TaskHandle, Workers};
use crate::playlist::Track;

pub const LYRICS_FILE: &str = "lyrics.lrc";

/// Text written when no synced lyrics were found; its presence marks the file stale
pub const NOT_FOUND_MARKER: &str = "Sorry, no lyrics were found for this track";

/// Timestamp at line start
static LINE_STAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\d+):(\d+\.\d+)\]").expect("line timestamp regex"));
/// Any timestamp, for retiming
static ANY_STAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+):(\d+\.\d+)\]").expect("timestamp regex"));

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LyricLine {
    pub offset_seconds: f64,
    pub text: String,
}

fn stamp_seconds(caps: &Captures) -> Option<f64> {
    let minutes: f64 = caps.get(1)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(2)?.as_str().parse().ok()?;
    Some(minutes * 60.0 + seconds)
}

/// Parse `.lrc` text into timed blocks. Lines before the first timestamp are ignored.
pub fn parse_lrc(text: &str) -> Vec<LyricLine> {
    let mut lines = Vec::new();
    let mut current: Option<(f64, Vec<String>)> = None;

    for line in text.lines() {
        let stamp = LINE_STAMP
            .captures(line)
            .and_then(|caps| Some((stamp_seconds(&caps)?, caps.get(0)?.end())));

        match stamp {
            Some((offset, end)) => {
                if let Some((offset, parts)) = current.take() {
                    lines.push(LyricLine {
                        offset_seconds: offset,
                        text: parts.join("\n"),
                    });
                }
                current = Some((offset, vec![line[end..].to_string()]));
            }
            None => {
                if let Some((_, parts)) = current.as_mut()
                    && !line.trim().is_empty()
                {
                    parts.push(line.trim_end().to_string());
                }
            }
        }
    }

    if let Some((offset, parts)) = current {
        lines.push(LyricLine {
            offset_seconds: offset,
            text: parts.join("\n"),
        });
    }
    lines
}

/// `mm:ss.cc`, clamped at zero
pub fn format_timestamp(seconds: f64) -> String {
    let centis = (seconds.max(0.0) * 100.0).round() as u64;
    format!("{:02}:{:02}.{:02}", centis / 6000, (centis % 6000) / 100, centis % 100)
}

/// Shift every timestamp in `text` by `offset` seconds.
///
/// Returns the new text and the number of timestamps rewritten. Everything
/// outside the brackets is kept byte for byte.
pub fn shift_timestamps(text: &str, offset: f64) -> (String, usize) {
    let mut count = 0;
    let shifted = ANY_STAMP.replace_all(text, |caps: &Captures| match stamp_seconds(caps) {
        Some(secs) => {
            count += 1;
            format!("[{}]", format_timestamp(secs + offset))
        }
        None => caps[0].to_string(),
    });
    (shifted.into_owned(), count)
}

/// True if the lyric file is absent or holds the not-found marker
pub fn needs_refresh(folder: &Path) -> bool {
    match std::fs::read_to_string(folder.join(LYRICS_FILE)) {
        Ok(text) => text.contains(NOT_FOUND_MARKER),
        Err(_) => true,
    }
}

/// True if parsed lyrics are empty or just the not-found placeholder
pub fn is_placeholder(lines: &[LyricLine]) -> bool {
    lines.is_empty() || lines.iter().any(|l| l.text.contains(NOT_FOUND_MARKER))
}

/// Write `folder/lyrics.lrc`: a title header at 00:00.00 followed by the synced
/// lyrics, or by the not-found marker when there are none.
pub fn write_lyrics_file(folder: &Path, artist: &str, title: &str, synced: Option<&str>) -> Result<()> {
    let mut content = format!("[00:00.00]{}\n{}\n", artist, title);

    match synced.filter(|s| !s.trim().is_empty()) {
        None => {
            content.push_str(NOT_FOUND_MARKER);
            content.push('\n');
        }
        Some(lyrics) => {
            for line in lyrics.lines().filter(|l| !l.trim().is_empty()) {
                if let Some((stamp, text)) = line.split_once(']') {
                    content.push_str(&format!("{}]{}\n", stamp, text.trim()));
                }
            }
        }
    }

    let path = folder.join(LYRICS_FILE);
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Source of synced lyrics (e.g. an online lyric database)
pub trait LyricsProvider: Send + Sync {
    /// Synced `.lrc` text for a track, or None if the provider has no match
    fn fetch_synced(&self, artist: &str, title: &str) -> Result<Option<String>>;
}

/// Offline provider: `<dir>/<artist> - <title>.lrc`
#[derive(Debug, Clone)]
pub struct LrcDirectory {
    dir: PathBuf,
}

impl LrcDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LyricsProvider for LrcDirectory {
    fn fetch_synced(&self, artist: &str, title: &str) -> Result<Option<String>> {
        let path = self.dir.join(format!("{} - {}.lrc", artist, title));
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(text))
    }
}

/// Outcome of a background freshness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LyricsRefresh {
    /// File present and not a placeholder, nothing fetched
    Fresh,
    /// Synced lyrics written
    Written,
    /// Provider had nothing (or failed); placeholder written
    NotFound,
    /// File could not be written
    Failed(String),
}

/// Lyrics cache plus preloader and freshness checks
pub struct LyricsManager {
    cache: Arc<KeyedCache<ResourceKey, Vec<LyricLine>>>,
    workers: Arc<Workers>,
}

impl LyricsManager {
    pub fn new(capacity: usize, workers: Arc<Workers>) -> Self {
        info!("LyricsManager: capacity={}", capacity);
        Self {
            cache: Arc::new(KeyedCache::new("lyrics", capacity)),
            workers,
        }
    }

    /// Parsed lyrics of a track folder; empty if absent or unreadable
    pub fn load(&self, folder: &Path) -> Arc<Vec<LyricLine>> {
        load_into(&self.cache, folder)
    }

    /// Warm lyrics within `radius` of `current`, skipping current and cached tracks
    pub fn preload(&self, folders: Vec<PathBuf>, current: usize, radius: usize) {
        let cache = Arc::clone(&self.cache);
        let radius = radius as isize;
        self.workers.execute(move || {
            let offsets = (-radius..=radius).filter(|o| *o != 0);
            for idx in neighbor_indices(folders.len(), current, offsets) {
                let folder = &folders[idx];
                if !cache.contains(&ResourceKey::lyrics(folder)) {
                    load_into(&cache, folder);
                }
            }
        });
    }

    /// Shift every timestamp of `folder/lyrics.lrc` by `offset` seconds in place
    pub fn adjust_timing(&self, folder: &Path, offset: f64) -> Result<usize, ResourceError> {
        let path = folder.join(LYRICS_FILE);
        if !path.is_file() {
            return Err(ResourceError::Missing {
                path: folder.to_path_buf(),
                missing: vec![LYRICS_FILE.to_string()],
            });
        }

        let text = std::fs::read_to_string(&path)?;
        let (shifted, count) = shift_timestamps(&text, offset);
        std::fs::write(&path, shifted)?;
        self.invalidate(folder);

        info!("Shifted {} timestamps by {:+.2}s in {}", count, offset, path.display());
        Ok(count)
    }

    /// Run the freshness check for one track on the worker pool.
    ///
    /// Fetches from `provider` only when the file is absent or a placeholder.
    pub fn refresh_async(&self, provider: Arc<dyn LyricsProvider>, track: Track) -> TaskHandle<LyricsRefresh> {
        let cache = Arc::clone(&self.cache);
        self.workers.spawn(move || {
            if !needs_refresh(&track.folder) {
                return LyricsRefresh::Fresh;
            }

            let synced = match provider.fetch_synced(&track.artist, &track.title) {
                Ok(found) => found,
                Err(e) => {
                    warn!("Lyrics lookup failed for {} - {}: {:#}", track.artist, track.title, e);
                    None
                }
            };
            let outcome = if synced.is_some() {
                LyricsRefresh::Written
            } else {
                LyricsRefresh::NotFound
            };

            if let Err(e) = write_lyrics_file(&track.folder, &track.artist, &track.title, synced.as_deref()) {
                warn!("{:#}", e);
                return LyricsRefresh::Failed(format!("{:#}", e));
            }
            cache.remove(&ResourceKey::lyrics(&track.folder));
            debug!("Lyrics refreshed for {} - {}: {:?}", track.artist, track.title, outcome);
            outcome
        })
    }

    pub fn contains(&self, folder: &Path) -> bool {
        self.cache.contains(&ResourceKey::lyrics(folder))
    }

    pub fn invalidate(&self, folder: &Path) {
        self.cache.remove(&ResourceKey::lyrics(folder));
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.cache.set_capacity(capacity);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.get_stats()
    }
}

fn load_into(cache: &KeyedCache<ResourceKey, Vec<LyricLine>>, folder: &Path) -> Arc<Vec<LyricLine>> {
    let path = folder.join(LYRICS_FILE);
    let result = cache.get(&ResourceKey::lyrics(folder), move || {
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(Some(parse_lrc(&text)))
    });
    result.ok().flatten().unwrap_or_default()
}
