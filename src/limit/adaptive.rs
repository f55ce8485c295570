//! Load-responsive limit adjustment.
//!
//! The controller samples local process utilization into a load factor in
//! [0, 1] and shrinks the configured base limit accordingly, floored at a
//! minimum so the system never fully starves. This is a best-effort,
//! single-node heuristic: it protects the local process only and makes no
//! cluster-wide fairness claims.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

/// Source of the current load factor, in [0, 1].
pub trait LoadSampler: Send + Sync {
    fn load_factor(&self) -> f64;
}

/// Constant load factor. Used in tests and as the non-Linux fallback.
pub struct FixedLoadSampler(pub f64);

impl LoadSampler for FixedLoadSampler {
    fn load_factor(&self) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// Samples CPU and resident-set utilization of the current process.
///
/// Reads `/proc/self/stat` and `/proc/self/statm` on Linux, at most once
/// per second; other platforms report zero load. The load factor is the
/// larger of the CPU fraction and the RSS fraction of `memory_budget`.
pub struct ProcessLoadSampler {
    memory_budget_bytes: u64,
    cached: Mutex<CachedSample>,
}

struct CachedSample {
    taken_at: Instant,
    cpu_ticks: u64,
    load: f64,
}

/// Linux userspace tick rate. Fixed at 100 Hz on every mainstream kernel.
#[cfg(target_os = "linux")]
const CLOCK_TICKS_PER_SEC: f64 = 100.0;
#[cfg(target_os = "linux")]
const PAGE_SIZE_BYTES: u64 = 4096;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

impl ProcessLoadSampler {
    pub fn new(memory_budget_bytes: u64) -> Self {
        Self {
            memory_budget_bytes: memory_budget_bytes.max(1),
            cached: Mutex::new(CachedSample {
                taken_at: Instant::now(),
                cpu_ticks: 0,
                load: 0.0,
            }),
        }
    }

    #[cfg(target_os = "linux")]
    fn sample(&self, cached: &mut CachedSample, elapsed: Duration) -> f64 {
        let cpu_ticks = match read_cpu_ticks() {
            Some(ticks) => ticks,
            None => return cached.load,
        };

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        let tick_delta = cpu_ticks.saturating_sub(cached.cpu_ticks) as f64;
        let cpu_fraction =
            tick_delta / CLOCK_TICKS_PER_SEC / elapsed.as_secs_f64() / cores;

        let rss_fraction = read_rss_bytes()
            .map(|rss| rss as f64 / self.memory_budget_bytes as f64)
            .unwrap_or(0.0);

        cached.cpu_ticks = cpu_ticks;
        cpu_fraction.max(rss_fraction).clamp(0.0, 1.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self, _cached: &mut CachedSample, _elapsed: Duration) -> f64 {
        0.0
    }
}

impl LoadSampler for ProcessLoadSampler {
    fn load_factor(&self) -> f64 {
        let mut cached = self.cached.lock();
        let elapsed = cached.taken_at.elapsed();
        if elapsed >= SAMPLE_INTERVAL {
            let load = self.sample(&mut cached, elapsed);
            cached.taken_at = Instant::now();
            cached.load = load;
        }
        cached.load
    }
}

/// utime + stime of the current process, in clock ticks.
#[cfg(target_os = "linux")]
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 and 15, counted after the parenthesised comm field.
    let rest = stat.rsplit(')').next()?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Resident set size of the current process, in bytes.
#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_SIZE_BYTES)
}

/// Shrinks limits under load.
pub struct AdaptiveController {
    sampler: Arc<dyn LoadSampler>,
    min_limit: u64,
}

impl AdaptiveController {
    pub fn new(sampler: Arc<dyn LoadSampler>, min_limit: u64) -> Self {
        Self { sampler, min_limit }
    }

    /// `floor(base * (1 - load))`, never below the configured minimum.
    pub fn effective_limit(&self, base_limit: u64) -> u64 {
        let load = self.sampler.load_factor().clamp(0.0, 1.0);
        let scaled = (base_limit as f64 * (1.0 - load)).floor() as u64;
        let effective = scaled.max(self.min_limit);
        trace!(
            base = base_limit,
            load = load,
            effective = effective,
            "adaptive limit computed"
        );
        effective
    }
}
