//! Host resource sampling.
//!
//! [`SystemProbe`] produces an immutable [`SystemSnapshot`]; the
//! [`CachedProbe`] wrapper refreshes one in the background so consumers
//! always read the most recent sample without blocking. Zero GPU or
//! temperature readings mean "no sensor", never "cold".

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Components, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One immutable sample of host resources.
#[derive(Debug, Clone, Copy)]
pub struct SystemSnapshot {
    /// Global CPU utilisation, 0–100.
    pub cpu_pct: f32,
    /// Free physical memory in bytes.
    pub ram_free_bytes: u64,
    /// Total physical memory in bytes.
    pub ram_total_bytes: u64,
    /// Hottest sensor reading in °C; zero when no sensor is exposed.
    pub temperature_c: f32,
    /// Whether a GPU sensor was observed.
    pub gpu_present: bool,
    /// GPU utilisation, 0–100; zero when unavailable.
    pub gpu_load_pct: f32,
    /// When the sample was taken.
    pub sampled_at: Instant,
}

impl SystemSnapshot {
    /// A zeroed snapshot stamped now, used before the first real sample.
    pub fn empty() -> Self {
        Self {
            cpu_pct: 0.0,
            ram_free_bytes: 0,
            ram_total_bytes: 0,
            temperature_c: 0.0,
            gpu_present: false,
            gpu_load_pct: 0.0,
            sampled_at: Instant::now(),
        }
    }
}

/// Source of [`SystemSnapshot`]s.
pub trait SystemProbe: Send + Sync {
    /// Takes a fresh sample. May cost a few milliseconds; callers on a hot
    /// path should go through [`CachedProbe`] instead.
    fn sample(&self) -> SystemSnapshot;
}

/// [`SystemProbe`] backed by the `sysinfo` crate.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    /// Creates a probe. The first CPU reading is zero until a second
    /// refresh happens; the background sampler makes this a non-issue.
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> SystemSnapshot {
        let (cpu_pct, ram_free_bytes, ram_total_bytes) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_usage(),
                system.available_memory(),
                system.total_memory(),
            )
        };

        let components = Components::new_with_refreshed_list();
        let mut temperature_c: f32 = 0.0;
        let mut gpu_present = false;
        for component in components.iter() {
            if let Some(temp) = component.temperature() {
                temperature_c = temperature_c.max(temp);
            }
            if component.label().to_ascii_lowercase().contains("gpu") {
                gpu_present = true;
            }
        }

        SystemSnapshot {
            cpu_pct,
            ram_free_bytes,
            ram_total_bytes,
            temperature_c,
            gpu_present,
            gpu_load_pct: 0.0,
            sampled_at: Instant::now(),
        }
    }
}

/// Background sampler caching the latest snapshot.
///
/// Consumers call [`CachedProbe::latest`], which only reads a watch channel
/// and never blocks on the underlying probe.
pub struct CachedProbe {
    rx: watch::Receiver<SystemSnapshot>,
    cancel: CancellationToken,
}

impl CachedProbe {
    /// Seeds the cache with one synchronous sample and starts a refresh
    /// task ticking every `interval`.
    pub fn spawn(probe: Arc<dyn SystemProbe>, interval: Duration) -> Self {
        let initial = probe.sample();
        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!("probe sampler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let probe = Arc::clone(&probe);
                        // Sensor reads can stall on some hosts; keep them off
                        // the async workers.
                        let sampled = tokio::task::spawn_blocking(move || probe.sample()).await;
                        match sampled {
                            Ok(snapshot) => {
                                if tx.send(snapshot).is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!(error = %e, "probe sample task failed"),
                        }
                    }
                }
            }
        });

        Self { rx, cancel }
    }

    /// Returns the most recent snapshot.
    #[inline]
    pub fn latest(&self) -> SystemSnapshot {
        *self.rx.borrow()
    }

    /// Stops the background sampler.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for CachedProbe {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Probe returning a caller-controlled snapshot, for tests.
#[cfg(any(test, feature = "mock"))]
pub struct StaticProbe {
    snapshot: Mutex<SystemSnapshot>,
}

#[cfg(any(test, feature = "mock"))]
impl StaticProbe {
    /// Creates a probe that reports a healthy, roomy host.
    pub fn healthy() -> Self {
        Self::with_snapshot(SystemSnapshot {
            cpu_pct: 10.0,
            ram_free_bytes: 16 * 1024 * 1024 * 1024,
            ram_total_bytes: 32 * 1024 * 1024 * 1024,
            temperature_c: 45.0,
            gpu_present: false,
            gpu_load_pct: 0.0,
            sampled_at: Instant::now(),
        })
    }

    /// Creates a probe pinned to `snapshot`.
    pub fn with_snapshot(snapshot: SystemSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Replaces the reported snapshot.
    pub fn set(&self, snapshot: SystemSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    /// Adjusts only the CPU reading.
    pub fn set_cpu_pct(&self, cpu_pct: f32) {
        self.snapshot.lock().cpu_pct = cpu_pct;
    }

    /// Adjusts only the free-RAM reading.
    pub fn set_ram_free_bytes(&self, ram_free_bytes: u64) {
        self.snapshot.lock().ram_free_bytes = ram_free_bytes;
    }

    /// Adjusts only the temperature reading.
    pub fn set_temperature_c(&self, temperature_c: f32) {
        self.snapshot.lock().temperature_c = temperature_c;
    }
}

#[cfg(any(test, feature = "mock"))]
impl SystemProbe for StaticProbe {
    fn sample(&self) -> SystemSnapshot {
        let mut snapshot = *self.snapshot.lock();
        snapshot.sampled_at = Instant::now();
        snapshot
    }
}
