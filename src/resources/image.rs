//! Cover art and icon manager
//!
//! Cover lookup order for a track folder:
//! 1. `cover.png`
//! 2. any other png/jpg in the folder
//! 3. picture embedded in an mp3 of the folder (or its `separated/`)
//! 4. generated default (never cached, so a cover added later is picked up)
//!
//! Covers are resized to fit the requested size keeping aspect ratio and cached
//! per (folder, size). Icons live in a separate, smaller cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ::image::imageops::FilterType;
use ::image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use anyhow::{Context, Result};
use lofty::file::TaggedFileExt;
use lofty::picture::PictureType;
use lofty::probe::Probe;
use log::{debug, info, trace};

use super::audio::SEPARATED_DIR;
use super::{neighbor_indices, ResourceKey};
use crate::core::{CacheStats, KeyedCache, ResourceError, Workers};

/// Cover file written next to each separated track
pub const COVER_FILE: &str = "cover.png";

const IMAGE_PATTERNS: [&str; 3] = ["*.png", "*.jpg", "*.jpeg"];

/// Where a cover came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverSource {
    File(PathBuf),
    Embedded(PathBuf),
    Default,
}

#[derive(Debug, Clone)]
pub struct CoverImage {
    pub image: DynamicImage,
    pub source: CoverSource,
}

impl CoverImage {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    pub fn is_default(&self) -> bool {
        self.source == CoverSource::Default
    }
}

/// Files in `dir` matching `pattern`, sorted
fn glob_in(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let escaped = ::glob::Pattern::escape(&dir.to_string_lossy());
    let full = format!("{}/{}", escaped, pattern);
    match ::glob::glob(&full) {
        Ok(paths) => {
            let mut found: Vec<PathBuf> = paths.filter_map(|p| p.ok()).filter(|p| p.is_file()).collect();
            found.sort();
            found
        }
        Err(e) => {
            debug!("Bad glob pattern {}: {}", full, e);
            Vec::new()
        }
    }
}

/// First front-cover-like picture embedded in an audio file's tags
pub fn extract_embedded_cover(audio: &Path) -> Option<DynamicImage> {
    let tagged = Probe::open(audio).ok()?.read().ok()?;
    let picture = tagged.tags().iter().find_map(|tag| {
        tag.pictures()
            .iter()
            .find(|pic| {
                matches!(
                    pic.pic_type(),
                    PictureType::CoverFront | PictureType::CoverBack | PictureType::Other
                )
            })
            .cloned()
    })?;

    match ::image::load_from_memory(picture.data()) {
        Ok(img) => Some(img),
        Err(e) => {
            debug!("Undecodable embedded cover in {}: {}", audio.display(), e);
            None
        }
    }
}

/// Extract the embedded cover of `audio`, resize it and save it as PNG at `dest`.
///
/// Returns Ok(false) if the file has no usable picture.
pub fn save_embedded_cover(audio: &Path, dest: &Path, size: (u32, u32)) -> Result<bool> {
    let Some(img) = extract_embedded_cover(audio) else {
        return Ok(false);
    };
    let img = img.resize_exact(size.0, size.1, FilterType::Lanczos3);
    img.save_with_format(dest, ImageFormat::Png)
        .with_context(|| format!("Failed to write cover {}", dest.display()))?;
    Ok(true)
}

fn open_image(path: &Path) -> Option<DynamicImage> {
    match ::image::open(path) {
        Ok(img) => Some(img),
        Err(e) => {
            debug!("Skipping unreadable image {}: {}", path.display(), e);
            None
        }
    }
}

/// Walk the lookup chain; None if the folder has no usable art
fn find_cover(folder: &Path) -> Option<(DynamicImage, CoverSource)> {
    let cover = folder.join(COVER_FILE);
    if cover.is_file()
        && let Some(img) = open_image(&cover)
    {
        return Some((img, CoverSource::File(cover)));
    }

    for pattern in IMAGE_PATTERNS {
        for path in glob_in(folder, pattern) {
            if path == cover {
                continue;
            }
            if let Some(img) = open_image(&path) {
                return Some((img, CoverSource::File(path)));
            }
        }
    }

    for dir in [folder.to_path_buf(), folder.join(SEPARATED_DIR)] {
        for mp3 in glob_in(&dir, "*.mp3") {
            if let Some(img) = extract_embedded_cover(&mp3) {
                return Some((img, CoverSource::Embedded(mp3)));
            }
        }
    }

    None
}

/// Fit inside `size` keeping aspect ratio
fn fit(img: DynamicImage, size: (u32, u32)) -> DynamicImage {
    if (img.width(), img.height()) == size {
        return img;
    }
    img.resize(size.0.max(1), size.1.max(1), FilterType::Triangle)
}

/// Built-in placeholder: diagonal gradient
pub fn default_cover(size: (u32, u32)) -> DynamicImage {
    let (w, h) = (size.0.max(1), size.1.max(1));
    let buf = RgbaImage::from_fn(w, h, |x, y| {
        let t = (x + y) as f32 / (w + h) as f32;
        Rgba([
            (0x3a as f32 * (1.0 - t) + 0x7e as f32 * t) as u8,
            (0xab as f32 * (1.0 - t) + 0x54 as f32 * t) as u8,
            (0xef as f32 * (1.0 - t) + 0xaf as f32 * t) as u8,
            0xff,
        ])
    });
    DynamicImage::ImageRgba8(buf)
}

/// Cover and icon caches
pub struct ImageManager {
    covers: Arc<KeyedCache<ResourceKey, CoverImage>>,
    icons: KeyedCache<ResourceKey, DynamicImage>,
    workers: Arc<Workers>,
}

impl ImageManager {
    pub fn new(capacity: usize, icon_capacity: usize, workers: Arc<Workers>) -> Self {
        info!("ImageManager: covers={}, icons={}", capacity, icon_capacity);
        Self {
            covers: Arc::new(KeyedCache::new("cover", capacity)),
            icons: KeyedCache::new("icon", icon_capacity),
            workers,
        }
    }

    /// Cover for a track folder, always returns an image
    pub fn load_cover(&self, folder: &Path, size: (u32, u32)) -> Arc<CoverImage> {
        load_cover_into(&self.covers, folder, size)
    }

    /// Small UI image; None if unreadable
    pub fn load_icon(&self, path: &Path, size: Option<(u32, u32)>) -> Option<Arc<DynamicImage>> {
        let key = ResourceKey {
            size,
            ..ResourceKey::image(path, (0, 0))
        };
        let path = path.to_path_buf();
        let result = self.icons.get(&key, move || {
            let img = ::image::open(&path).map_err(ResourceError::load)?;
            Ok(Some(match size {
                Some(size) => fit(img, size),
                None => img,
            }))
        });
        result.ok().flatten()
    }

    /// Warm covers of the previous and next track in the background
    pub fn preload_covers(&self, folders: Vec<PathBuf>, current: usize, size: (u32, u32)) {
        let covers = Arc::clone(&self.covers);
        self.workers.execute(move || {
            for idx in neighbor_indices(folders.len(), current, [-1, 1]) {
                let folder = &folders[idx];
                if covers.contains(&ResourceKey::image(folder, size)) {
                    continue;
                }
                let cover = load_cover_into(&covers, folder, size);
                trace!("Preloaded cover {} ({:?})", folder.display(), cover.source);
            }
        });
    }

    pub fn contains_cover(&self, folder: &Path, size: (u32, u32)) -> bool {
        self.covers.contains(&ResourceKey::image(folder, size))
    }

    /// Drop every cached size of one folder's cover
    pub fn invalidate(&self, folder: &Path) {
        for key in self.covers.keys_by_recency() {
            if key.path == folder {
                self.covers.remove(&key);
            }
        }
    }

    pub fn clear(&self) {
        self.covers.clear();
        self.icons.clear();
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.covers.set_capacity(capacity);
    }

    pub fn stats(&self) -> CacheStats {
        self.covers.get_stats()
    }

    pub fn icon_stats(&self) -> CacheStats {
        self.icons.get_stats()
    }
}

fn load_cover_into(cache: &KeyedCache<ResourceKey, CoverImage>, folder: &Path, size: (u32, u32)) -> Arc<CoverImage> {
    let key = ResourceKey::image(folder, size);
    let dir = folder.to_path_buf();
    let result = cache.get(&key, move || {
        Ok(find_cover(&dir).map(|(image, source)| CoverImage {
            image: fit(image, size),
            source,
        }))
    });

    match result {
        Ok(Some(cover)) => cover,
        Ok(None) | Err(_) => {
            debug!("No cover in {}, using default", folder.display());
            Arc::new(CoverImage {
                image: default_cover(size),
                source: CoverSource::Default,
            })
        }
    }
}
