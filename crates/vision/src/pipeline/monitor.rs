//! Frame-rate and latency bookkeeping shared between the inference worker
//! (writer) and the monitoring scheduler (reader).

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::pipeline::{
    clock::{Clock, SystemClock},
    probes::{AcceleratorProbe, AcceleratorStats, ProbeError, SystemProbe, SystemStats},
    window::RollingWindow,
};

/// FPS is sampled at most once per this period.
pub const FPS_EPOCH: Duration = Duration::from_secs(1);

/// Point-in-time view of pipeline performance and host telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Mean of the recent per-second FPS samples.
    pub fps: f64,
    /// Mean processing time per frame, seconds.
    pub processing_time: f64,
    /// Population standard deviation of processing time, seconds.
    pub processing_time_std: f64,
    #[serde(flatten)]
    pub accelerator: Option<AcceleratorStats>,
    #[serde(flatten)]
    pub system: Option<SystemStats>,
}

struct MonitorState {
    fps: RollingWindow,
    processing: RollingWindow,
    frames_since_epoch: u64,
    epoch: Instant,
}

pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
    clock: Arc<dyn Clock>,
    accelerator: Option<Box<dyn AcceleratorProbe>>,
    system: Option<Box<dyn SystemProbe>>,
    accelerator_reported: AtomicBool,
    system_reported: AtomicBool,
}

impl PerformanceMonitor {
    /// Monitor keeping `window_size` samples per window, on the system clock.
    pub fn new(window_size: usize) -> Self {
        Self::with_clock(window_size, Arc::new(SystemClock))
    }

    pub fn with_clock(window_size: usize, clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self {
            state: Mutex::new(MonitorState {
                fps: RollingWindow::new(window_size),
                processing: RollingWindow::new(window_size),
                frames_since_epoch: 0,
                epoch,
            }),
            clock,
            accelerator: None,
            system: None,
            accelerator_reported: AtomicBool::new(false),
            system_reported: AtomicBool::new(false),
        }
    }

    pub fn with_accelerator_probe(mut self, probe: impl AcceleratorProbe + 'static) -> Self {
        self.accelerator = Some(Box::new(probe));
        self
    }

    pub fn with_system_probe(mut self, probe: impl SystemProbe + 'static) -> Self {
        self.system = Some(Box::new(probe));
        self
    }

    /// Start timing a unit of work. The sample is recorded when the guard is
    /// dropped, whether the work returned normally, failed or panicked.
    pub fn scoped_measure(&self) -> MeasureGuard<'_> {
        MeasureGuard {
            monitor: self,
            started: self.clock.now(),
        }
    }

    /// Run `work` under [`scoped_measure`](Self::scoped_measure).
    pub fn measure<T>(&self, work: impl FnOnce() -> T) -> T {
        let _guard = self.scoped_measure();
        work()
    }

    /// Record one processed unit that took `elapsed`, then run the FPS step.
    pub fn record(&self, elapsed: Duration) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.processing.push(elapsed.as_secs_f64());
        state.frames_since_epoch += 1;

        let since_epoch = now.saturating_duration_since(state.epoch);
        if since_epoch >= FPS_EPOCH {
            let fps = state.frames_since_epoch as f64 / since_epoch.as_secs_f64();
            state.fps.push(fps);
            state.frames_since_epoch = 0;
            state.epoch = now;
            drop(state);
            metrics::gauge!("vision_pipeline_fps").set(fps);
        }
        metrics::histogram!("vision_stage_latency_seconds", "stage" => "inference")
            .record(elapsed.as_secs_f64());
    }

    /// Build a snapshot from the windows and a fresh probe sample.
    ///
    /// Probe failures are logged and leave the corresponding fields absent.
    pub fn snapshot(&self) -> StatsSnapshot {
        let (fps, processing_time, processing_time_std) = {
            let state = self.lock_state();
            (
                state.fps.mean(),
                state.processing.mean(),
                state.processing.std(),
            )
        };

        let accelerator = self.accelerator.as_ref().and_then(|probe| {
            absorb_probe_error("accelerator", &self.accelerator_reported, probe.sample())
        });
        let system = self
            .system
            .as_ref()
            .and_then(|probe| absorb_probe_error("system", &self.system_reported, probe.sample()));

        StatsSnapshot {
            fps,
            processing_time,
            processing_time_std,
            accelerator,
            system,
        }
    }

    /// Snapshot without probing; used on hot paths such as the display overlay.
    pub fn window_stats(&self) -> StatsSnapshot {
        let state = self.lock_state();
        StatsSnapshot {
            fps: state.fps.mean(),
            processing_time: state.processing.mean(),
            processing_time_std: state.processing.std(),
            accelerator: None,
            system: None,
        }
    }

    /// Take a snapshot and log it.
    pub fn log_performance(&self) -> StatsSnapshot {
        let stats = self.snapshot();
        self.log_stats(&stats);
        stats
    }

    /// Emit one summary line for `stats`.
    pub fn log_stats(&self, stats: &StatsSnapshot) {
        let gpu_load = stats
            .accelerator
            .map(|gpu| format!("{:.0}%", gpu.load))
            .unwrap_or_else(|| "N/A".to_string());
        let gpu_memory = stats
            .accelerator
            .map(|gpu| format!("{:.0}/{:.0}MB", gpu.memory_used, gpu.memory_total))
            .unwrap_or_else(|| "N/A".to_string());
        info!(
            "Performance metrics - FPS: {:.1}, processing time: {:.1}ms, GPU load: {gpu_load}, GPU memory: {gpu_memory}",
            stats.fps,
            stats.processing_time * 1000.0,
        );
    }

    pub fn fps_sample_count(&self) -> usize {
        self.lock_state().fps.len()
    }

    pub fn processing_sample_count(&self) -> usize {
        self.lock_state().processing.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Log a probe failure (warn once, debug afterwards) and degrade to `None`.
fn absorb_probe_error<T>(
    name: &str,
    reported: &AtomicBool,
    sample: Result<Option<T>, ProbeError>,
) -> Option<T> {
    match sample {
        Ok(value) => value,
        Err(err) => {
            if reported.swap(true, Ordering::Relaxed) {
                debug!("{name} probe failed: {err}");
            } else {
                warn!("{name} probe failed, omitting its fields: {err}");
            }
            None
        }
    }
}

/// Records elapsed time into its monitor on drop.
#[must_use = "the measurement is recorded when the guard is dropped"]
pub struct MeasureGuard<'a> {
    monitor: &'a PerformanceMonitor,
    started: Instant,
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self
            .monitor
            .clock
            .now()
            .saturating_duration_since(self.started);
        self.monitor.record(elapsed);
    }
}
