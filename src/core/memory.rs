//! Memory policy: process memory sampling, cleanup urgency and eviction priority
//!
//! **Why**: Audio stems dominate the footprint; the policy decides when caches
//! should shrink and which one goes first. Decisions are advisory: the caller
//! picks which manager's `cleanup`/`clear` to run.
//!
//! **Used by**: AppContext (maintenance tick), PrefetchScheduler (preload plan)

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

/// Cache family, the unit of memory-cleanup priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    Audio,
    Image,
    Lyrics,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Audio => write!(f, "audio"),
            ResourceKind::Image => write!(f, "images"),
            ResourceKind::Lyrics => write!(f, "lyrics"),
        }
    }
}

/// Samples kept for trend detection
const HISTORY_LEN: usize = 10;
/// Samples counted as "recent" when computing the trend
const RECENT_LEN: usize = 3;
/// Relative band inside which the trend is considered stable
const TREND_BAND: f64 = 0.05;

/// Source of process memory readings (MB)
pub trait MemorySampler: Send + Sync {
    fn usage_mb(&self) -> f64;
}

/// Reads resident memory of the current process via sysinfo
pub struct ProcessMemory {
    sys: Mutex<System>,
    pid: Option<sysinfo::Pid>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemory {
    fn usage_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid)
            .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
            .unwrap_or(0.0)
    }
}

/// Direction of recent memory usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemoryTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// What the prefetcher may do under current memory pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadPlan {
    pub audio: bool,
    pub lyrics: bool,
    pub covers: bool,
    pub count: usize,
}

/// Memory snapshot for reports
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub usage_mb: f64,
    pub ceiling_mb: f64,
    pub usage_pct: f64,
    pub trend: MemoryTrend,
}

/// Memory-pressure policy
///
/// Keeps a bounded history of usage samples. `sample()` refreshes it; the
/// queries below read the latest sample (taking one first if history is empty).
pub struct MemoryPolicy {
    sampler: Box<dyn MemorySampler>,
    ceiling_mb: f64,
    history: Mutex<VecDeque<f64>>,
}

impl MemoryPolicy {
    /// Create policy with a memory ceiling (`max_memory_usage_mb`)
    pub fn new(ceiling_mb: u64, sampler: Box<dyn MemorySampler>) -> Self {
        info!("MemoryPolicy init: ceiling={} MB", ceiling_mb);
        Self {
            sampler,
            ceiling_mb: ceiling_mb.max(1) as f64,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    /// Policy reading the real process memory
    pub fn for_process(ceiling_mb: u64) -> Self {
        Self::new(ceiling_mb, Box::new(ProcessMemory::new()))
    }

    pub fn ceiling_mb(&self) -> f64 {
        self.ceiling_mb
    }

    /// Take a sample and append it to history; returns usage in MB
    pub fn sample(&self) -> f64 {
        let usage = self.sampler.usage_mb();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(usage);
        debug!("Memory sample: {:.1} MB ({} samples)", usage, history.len());
        usage
    }

    /// Most recent usage (samples once if history is empty)
    pub fn usage_mb(&self) -> f64 {
        let last = self
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .copied();
        last.unwrap_or_else(|| self.sample())
    }

    /// Usage as fraction of ceiling
    pub fn usage_fraction(&self) -> f64 {
        self.usage_mb() / self.ceiling_mb
    }

    /// Mean of the last 3 samples against the mean of older ones
    pub fn trend(&self) -> MemoryTrend {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() <= RECENT_LEN {
            return MemoryTrend::Stable;
        }

        let split = history.len() - RECENT_LEN;
        let older = history.iter().take(split).sum::<f64>() / split as f64;
        let recent = history.iter().skip(split).sum::<f64>() / RECENT_LEN as f64;

        if recent > older * (1.0 + TREND_BAND) {
            MemoryTrend::Increasing
        } else if recent < older * (1.0 - TREND_BAND) {
            MemoryTrend::Decreasing
        } else {
            MemoryTrend::Stable
        }
    }

    /// Over the ceiling, or over 80% of it while still growing
    pub fn should_cleanup(&self) -> bool {
        let fraction = self.usage_fraction();
        fraction > 1.0 || (fraction > 0.8 && self.trend() == MemoryTrend::Increasing)
    }

    /// Order in which caches should be shrunk, first = evict first
    pub fn cleanup_priority(&self) -> [ResourceKind; 3] {
        let fraction = self.usage_fraction();
        if fraction > 0.9 || self.trend() == MemoryTrend::Increasing {
            [ResourceKind::Audio, ResourceKind::Image, ResourceKind::Lyrics]
        } else if fraction > 0.75 {
            [ResourceKind::Image, ResourceKind::Audio, ResourceKind::Lyrics]
        } else {
            [ResourceKind::Lyrics, ResourceKind::Image, ResourceKind::Audio]
        }
    }

    /// Suggest a new capacity from the average load time of a cache.
    ///
    /// Slow loads (>2s) grow the cache, very fast ones (<100ms) shrink it.
    pub fn suggest_capacity(&self, current: usize, avg_load_time: Duration) -> usize {
        let secs = avg_load_time.as_secs_f64();
        if secs > 2.0 {
            (current + 10).min(current * 3 / 2).max(current + 1)
        } else if secs > 0.0 && secs < 0.1 {
            current.saturating_sub(5).max(current * 4 / 5).max(1)
        } else {
            current
        }
    }

    /// Reduce preloading under memory pressure
    pub fn preload_plan(&self, preload_count: usize, playlist_len: usize, current: usize) -> PreloadPlan {
        let fraction = self.usage_fraction();
        let mut plan = PreloadPlan {
            audio: true,
            lyrics: true,
            covers: true,
            count: preload_count,
        };

        if fraction > 0.8 {
            plan.count = 1;
            plan.covers = false;
        } else if fraction > 0.6 {
            plan.count = plan.count.min(2);
            plan.covers = current % 2 == 0;
        }

        // Never wrap around onto tracks we'd preload twice
        plan.count = plan.count.min(playlist_len.saturating_sub(1));
        plan
    }

    pub fn report(&self) -> MemoryReport {
        let usage_mb = self.usage_mb();
        MemoryReport {
            usage_mb,
            ceiling_mb: self.ceiling_mb,
            usage_pct: usage_mb / self.ceiling_mb * 100.0,
            trend: self.trend(),
        }
    }
}

/// Total physical memory in GB
pub fn system_memory_gb() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() as f64 / 1024.0 / 1024.0 / 1024.0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sampler replaying a scripted sequence (last value repeats)
    pub(crate) struct Scripted {
        values: Mutex<VecDeque<f64>>,
        last: Mutex<f64>,
    }

    impl Scripted {
        pub(crate) fn new(values: &[f64]) -> Self {
            Self {
                values: Mutex::new(values.iter().copied().collect()),
                last: Mutex::new(0.0),
            }
        }
    }

    impl MemorySampler for Scripted {
        fn usage_mb(&self) -> f64 {
            let mut last = self.last.lock().unwrap();
            if let Some(v) = self.values.lock().unwrap().pop_front() {
                *last = v;
            }
            *last
        }
    }

    fn policy(ceiling: u64, values: &[f64]) -> MemoryPolicy {
        let policy = MemoryPolicy::new(ceiling, Box::new(Scripted::new(values)));
        for _ in values {
            policy.sample();
        }
        policy
    }

    #[test]
    fn test_trend_needs_history() {
        assert_eq!(policy(512, &[100.0, 200.0, 300.0]).trend(), MemoryTrend::Stable);
    }

    #[test]
    fn test_trend_detection() {
        assert_eq!(
            policy(512, &[100.0, 100.0, 100.0, 150.0, 160.0, 170.0]).trend(),
            MemoryTrend::Increasing
        );
        assert_eq!(
            policy(512, &[300.0, 300.0, 200.0, 190.0, 180.0]).trend(),
            MemoryTrend::Decreasing
        );
        assert_eq!(
            policy(512, &[200.0, 201.0, 199.0, 200.0]).trend(),
            MemoryTrend::Stable
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let values: Vec<f64> = (0..25).map(|v| v as f64).collect();
        let p = policy(512, &values);
        assert_eq!(p.history.lock().unwrap().len(), HISTORY_LEN);
        assert_eq!(p.usage_mb(), 24.0);
    }

    #[test]
    fn test_should_cleanup_over_ceiling() {
        assert!(policy(100, &[120.0]).should_cleanup());
        assert!(!policy(100, &[50.0]).should_cleanup());
    }

    #[test]
    fn test_should_cleanup_preventive() {
        // 85% but flat: no cleanup
        assert!(!policy(100, &[85.0, 85.0, 85.0, 85.0]).should_cleanup());
        // 85% and climbing: preventive cleanup
        assert!(policy(100, &[60.0, 60.0, 80.0, 84.0, 85.0]).should_cleanup());
    }

    #[test]
    fn test_resource_kind_names() {
        assert_eq!(ResourceKind::Audio.to_string(), "audio");
        assert_eq!(ResourceKind::Image.to_string(), "images");
        assert_eq!(crate::resources::ResourceKind::Lyrics, ResourceKind::Lyrics);
    }

    #[test]
    fn test_cleanup_priority_bands() {
        use ResourceKind::*;
        assert_eq!(policy(100, &[95.0]).cleanup_priority(), [Audio, Image, Lyrics]);
        assert_eq!(policy(100, &[80.0]).cleanup_priority(), [Image, Audio, Lyrics]);
        assert_eq!(policy(100, &[40.0]).cleanup_priority(), [Lyrics, Image, Audio]);
        // Rising trend escalates even at low usage
        assert_eq!(
            policy(100, &[10.0, 10.0, 30.0, 35.0, 40.0]).cleanup_priority(),
            [Audio, Image, Lyrics]
        );
    }

    #[test]
    fn test_suggest_capacity() {
        let p = policy(100, &[10.0]);
        assert_eq!(p.suggest_capacity(20, Duration::from_secs(3)), 30);
        assert_eq!(p.suggest_capacity(20, Duration::from_millis(50)), 16);
        assert_eq!(p.suggest_capacity(20, Duration::from_millis(500)), 20);
        assert_eq!(p.suggest_capacity(20, Duration::ZERO), 20);
    }

    #[test]
    fn test_preload_plan_under_pressure() {
        let relaxed = policy(100, &[10.0]).preload_plan(3, 10, 0);
        assert_eq!(relaxed.count, 3);
        assert!(relaxed.covers);

        let tight = policy(100, &[90.0]).preload_plan(3, 10, 0);
        assert_eq!(tight.count, 1);
        assert!(!tight.covers);

        let small_playlist = policy(100, &[10.0]).preload_plan(3, 2, 0);
        assert_eq!(small_playlist.count, 1);
    }

    #[test]
    fn test_process_memory_reads_something() {
        let usage = ProcessMemory::new().usage_mb();
        assert!(usage >= 0.0);
    }
}
