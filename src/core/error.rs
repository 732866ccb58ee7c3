//! Error types crossing the cache / manager boundary.

use std::path::PathBuf;
use std::time::Duration;

/// Resource loading errors
///
/// Returned as values by every public cache and manager operation; loaders
/// never propagate panics or raw I/O errors past the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    /// Required files are absent (not retried automatically)
    Missing { path: PathBuf, missing: Vec<String> },
    /// I/O or decode failure (nothing cached, next request retries)
    LoadFailure(String),
    /// Loader exceeded `load_timeout_seconds`
    Timeout(Duration),
}

impl ResourceError {
    pub fn load(err: impl std::fmt::Display) -> Self {
        ResourceError::LoadFailure(err.to_string())
    }
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceError::Missing { path, missing } => write!(
                f,
                "Missing files in {}: {}",
                path.display(),
                missing.join(", ")
            ),
            ResourceError::LoadFailure(e) => write!(f, "Load failed: {}", e),
            ResourceError::Timeout(d) => write!(f, "Load timed out after {:.1}s", d.as_secs_f64()),
        }
    }
}

impl std::error::Error for ResourceError {}

impl From<std::io::Error> for ResourceError {
    fn from(e: std::io::Error) -> Self {
        ResourceError::LoadFailure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_lists_files() {
        let err = ResourceError::Missing {
            path: PathBuf::from("/music/a/b/separated"),
            missing: vec!["bass.mp3".to_string(), "other.mp3".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("bass.mp3, other.mp3"));
        assert!(msg.contains("separated"));
    }
}
