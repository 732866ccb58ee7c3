//! Playlist index: tracks discovered from catalog descriptors
//!
//! A descriptor is a JSON file `{ "<artist>": { "<title>": { "path": ... } } }`
//! sitting in the track folder. Scanning walks a library tree, parses every
//! `*.json` in parallel and appends tracks not seen before. Identity is the
//! exact (artist, title) pair; insertion order is playlist order.
//!
//! The walk and parse ([`discover`]) need no playlist access and can run on a
//! worker; [`PlaylistIndex::merge`] is the cheap part that mutates the index.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use walkdir::WalkDir;

use crate::resources::audio::missing_stems;

/// Descriptor written by the separation pipeline
pub const DESCRIPTOR_FILE: &str = "data.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Track {
    pub artist: String,
    pub title: String,
    /// Directory holding the descriptor, stems, cover and lyrics
    pub folder: PathBuf,
    pub has_separated_stems: bool,
}

impl Track {
    pub fn new(artist: impl Into<String>, title: impl Into<String>, folder: PathBuf) -> Self {
        let has_separated_stems = missing_stems(&folder).is_empty();
        Self {
            artist: artist.into(),
            title: title.into(),
            folder,
            has_separated_stems,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

type TrackId = (String, String);

/// Result of one scan pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub descriptors: usize,
    /// Indices of newly appended tracks
    pub added: Vec<usize>,
    /// Every track found in this pass (new or already known)
    pub found: Vec<Track>,
    /// Descriptors that could not be read or parsed, with the reason
    pub malformed: Vec<(PathBuf, String)>,
}

impl ScanReport {
    pub fn duplicates(&self) -> usize {
        self.found.len() - self.added.len()
    }
}

/// Parse one descriptor into tracks rooted at its directory
pub fn parse_descriptor(path: &Path) -> Result<Vec<Track>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let catalog: IndexMap<String, IndexMap<String, serde_json::Value>> =
        serde_json::from_str(&text).with_context(|| format!("Malformed descriptor {}", path.display()))?;

    let folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok(catalog
        .into_iter()
        .flat_map(|(artist, titles)| {
            let folder = folder.clone();
            titles
                .into_keys()
                .map(move |title| Track::new(artist.clone(), title, folder.clone()))
        })
        .collect())
}

/// Write `folder/data.json` describing one track
pub fn write_descriptor(folder: &Path, artist: &str, title: &str) -> Result<PathBuf> {
    let descriptor = serde_json::json!({
        artist: { title: { "path": folder.to_string_lossy() } }
    });
    let path = folder.join(DESCRIPTOR_FILE);
    let json = serde_json::to_string_pretty(&descriptor).context("Failed to serialize descriptor")?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Descriptors parsed under one root, not yet merged into a playlist
#[derive(Debug)]
pub struct Discovery {
    root: PathBuf,
    parsed: Vec<(PathBuf, Result<Vec<Track>>)>,
}

impl Discovery {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Walk `root` for descriptors and parse them in parallel
pub fn discover(root: &Path) -> Discovery {
    let mut descriptors: Vec<PathBuf> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                debug!("Scan: skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")))
        .collect();
    descriptors.sort();

    let parsed = descriptors
        .into_par_iter()
        .map(|path| {
            let result = parse_descriptor(&path);
            (path, result)
        })
        .collect();

    Discovery {
        root: root.to_path_buf(),
        parsed,
    }
}

/// Ordered, deduplicated track catalog
#[derive(Debug, Default)]
pub struct PlaylistIndex {
    tracks: IndexMap<TrackId, Track>,
}

impl PlaylistIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `root` recursively for descriptors and append unseen tracks.
    ///
    /// Known tracks keep their position; their stem flag is refreshed.
    pub fn scan(&mut self, root: &Path) -> ScanReport {
        self.merge(discover(root))
    }

    /// Append the unseen tracks of a finished discovery
    pub fn merge(&mut self, discovery: Discovery) -> ScanReport {
        let Discovery { root, parsed } = discovery;
        let mut report = ScanReport {
            descriptors: parsed.len(),
            ..ScanReport::default()
        };

        for (path, result) in parsed {
            let tracks = match result {
                Ok(tracks) => tracks,
                Err(e) => {
                    warn!("Scan: {:#}", e);
                    report.malformed.push((path, format!("{:#}", e)));
                    continue;
                }
            };

            for track in tracks {
                let id = (track.artist.clone(), track.title.clone());
                match self.tracks.get_full_mut(&id) {
                    Some((_, _, known)) => {
                        known.has_separated_stems = track.has_separated_stems;
                    }
                    None => {
                        debug!("Scan: found {}", track.display_name());
                        let (idx, _) = self.tracks.insert_full(id, track.clone());
                        report.added.push(idx);
                    }
                }
                report.found.push(track);
            }
        }

        info!(
            "Scanned {}: {} descriptors, {} new tracks, {} known, {} malformed",
            root.display(),
            report.descriptors,
            report.added.len(),
            report.duplicates(),
            report.malformed.len()
        );
        report
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get_index(index).map(|(_, t)| t)
    }

    pub fn position(&self, artist: &str, title: &str) -> Option<usize> {
        self.tracks.get_index_of(&(artist.to_string(), title.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Track folders in playlist order, for preloaders
    pub fn folders(&self) -> Vec<PathBuf> {
        self.tracks.values().map(|t| t.folder.clone()).collect()
    }

    /// Remove one track; later tracks shift down by one
    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.tracks.shift_remove_index(index).map(|(_, t)| t)
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Indices within `radius` of `index` (wrapping), excluding `index`
    pub fn neighbors(&self, index: usize, radius: usize) -> Vec<usize> {
        let radius = radius as isize;
        crate::resources::neighbor_indices(self.len(), index, (-radius..=radius).filter(|o| *o != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::audio::tests::make_track;

    fn descriptor(dir: &Path, json: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(DESCRIPTOR_FILE), json).unwrap();
    }

    #[test]
    fn test_scan_finds_nested_descriptors() {
        let tmp = tempfile::tempdir().unwrap();
        descriptor(&tmp.path().join("A/one"), r#"{"A": {"One": {"path": "x"}}}"#);
        descriptor(&tmp.path().join("B/two"), r#"{"B": {"Two": {}, "Three": {}}}"#);

        let mut playlist = PlaylistIndex::new();
        let report = playlist.scan(tmp.path());

        assert_eq!(report.descriptors, 2);
        assert_eq!(report.added, vec![0, 1, 2]);
        assert_eq!(playlist.get(0).unwrap().title, "One");
        assert_eq!(playlist.get(0).unwrap().folder, tmp.path().join("A/one"));
        assert_eq!(playlist.position("B", "Three"), Some(2));
    }

    #[test]
    fn test_rescan_deduplicates() {
        let tmp = tempfile::tempdir().unwrap();
        descriptor(&tmp.path().join("a"), r#"{"Artist": {"Song": {}}}"#);
        descriptor(&tmp.path().join("b"), r#"{"Artist": {"Song": {}}, "artist": {"Song": {}}}"#);

        let mut playlist = PlaylistIndex::new();
        let first = playlist.scan(tmp.path());
        assert_eq!(first.added.len(), 2);
        assert_eq!(first.duplicates(), 1);

        let second = playlist.scan(tmp.path());
        assert!(second.added.is_empty());
        assert_eq!(second.found.len(), 3);
        assert_eq!(playlist.len(), 2);
    }

    #[test]
    fn test_malformed_descriptor_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        descriptor(&tmp.path().join("good"), r#"{"A": {"B": {}}}"#);
        descriptor(&tmp.path().join("bad"), "{ nope");
        descriptor(&tmp.path().join("wrong_shape"), r#"["not", "a", "catalog"]"#);

        let mut playlist = PlaylistIndex::new();
        let report = playlist.scan(tmp.path());
        assert_eq!(report.malformed.len(), 2);
        assert_eq!(playlist.len(), 1);
    }

    #[test]
    fn test_rescan_refreshes_stem_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("song");
        descriptor(&folder, r#"{"A": {"Song": {}}}"#);

        let mut playlist = PlaylistIndex::new();
        playlist.scan(tmp.path());
        assert!(!playlist.get(0).unwrap().has_separated_stems);

        make_track(tmp.path(), "song");
        playlist.scan(tmp.path());
        assert!(playlist.get(0).unwrap().has_separated_stems);
    }

    #[test]
    fn test_discover_off_thread_then_merge() {
        let tmp = tempfile::tempdir().unwrap();
        descriptor(&tmp.path().join("a"), r#"{"A": {"One": {}}}"#);
        descriptor(&tmp.path().join("b"), "{ nope");

        let root = tmp.path().to_path_buf();
        let discovery = std::thread::spawn(move || discover(&root)).join().unwrap();
        assert_eq!(discovery.root(), tmp.path());

        let mut playlist = PlaylistIndex::new();
        let report = playlist.merge(discovery);
        assert_eq!(report.descriptors, 2);
        assert_eq!(report.added, vec![0]);
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(playlist.get(0).unwrap().title, "One");
    }

    #[test]
    fn test_write_descriptor_scans_back() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("Artist").join("Title");
        std::fs::create_dir_all(&folder).unwrap();
        write_descriptor(&folder, "Artist", "Title").unwrap();

        let tracks = parse_descriptor(&folder.join(DESCRIPTOR_FILE)).unwrap();
        assert_eq!(tracks, vec![Track::new("Artist", "Title", folder)]);
    }

    #[test]
    fn test_remove_and_neighbors() {
        let tmp = tempfile::tempdir().unwrap();
        descriptor(&tmp.path().join("x"), r#"{"A": {"1": {}, "2": {}, "3": {}, "4": {}}}"#);

        let mut playlist = PlaylistIndex::new();
        playlist.scan(tmp.path());
        assert_eq!(playlist.neighbors(0, 1), vec![3, 1]);

        let removed = playlist.remove(1).unwrap();
        assert_eq!(removed.title, "2");
        assert_eq!(playlist.get(1).unwrap().title, "3");
        assert_eq!(playlist.position("A", "4"), Some(2));
        assert!(playlist.remove(10).is_none());

        playlist.clear();
        assert!(playlist.is_empty());
        assert!(playlist.neighbors(0, 1).is_empty());
    }
}
