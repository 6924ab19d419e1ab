//! Capture loop and process-level wiring of the detection pipeline.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use ml_core::IouTracker;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::FrameSource;

use crate::pipeline::{
    backend::{InferenceBackend, NullBackend, Tracked},
    bounded::{BoundedPipeline, DetectionResult, PipelineStats},
    config::{BackendKind, VisionConfig},
    display::{FrameDisplay, LogDisplay, overlay_text},
    monitor::{PerformanceMonitor, StatsSnapshot},
    probes::{NvidiaSmiProbe, ProcSystemProbe},
    scheduler::MonitoringScheduler,
    sink::JsonFileSink,
    telemetry,
};

/// How long to wait for queued frames after the source reports end of stream.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub buffer_size: usize,
    pub display_stats: bool,
    pub max_frames: Option<u64>,
}

impl SessionOptions {
    pub fn from_config(config: &VisionConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            display_stats: config.display_stats,
            max_frames: config.max_frames,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    FrameLimit,
    Shutdown,
}

#[derive(Debug)]
pub struct SessionSummary {
    pub reason: StopReason,
    pub frames_captured: u64,
    pub frames_displayed: u64,
    pub pipeline: PipelineStats,
    pub stats: StatsSnapshot,
    pub device: String,
    pub elapsed: Duration,
}

impl SessionSummary {
    pub fn log(&self) {
        info!("Final Performance Statistics:");
        info!("Average FPS: {:.1}", self.stats.fps);
        info!(
            "Average Processing Time: {:.1}ms",
            self.stats.processing_time * 1000.0
        );
        info!("Device Used: {}", self.device);
        info!(
            captured = self.frames_captured,
            displayed = self.frames_displayed,
            dropped = self.pipeline.dropped,
            failed = self.pipeline.failed,
            elapsed_s = self.elapsed.as_secs_f64(),
            reason = ?self.reason,
            "session finished"
        );
    }
}

/// Drive capture → inference → display until the source ends, `max_frames`
/// frames were captured, or `shutdown` is raised.
///
/// Capture errors stop the session and are returned after the pipeline has
/// been shut down; per-frame inference and display failures are logged.
pub fn run_session<B>(
    source: &mut dyn FrameSource,
    backend: B,
    display: &mut dyn FrameDisplay,
    monitor: Arc<PerformanceMonitor>,
    opts: &SessionOptions,
    shutdown: &AtomicBool,
) -> Result<SessionSummary>
where
    B: InferenceBackend + 'static,
{
    let device = backend.device();
    let span = info_span!("session", source = %source.describe(), device = %device);
    let _entered = span.enter();

    let mut pipeline = BoundedPipeline::start(opts.buffer_size, backend, monitor.clone())?;
    let started = Instant::now();
    let mut captured = 0u64;
    let mut displayed = 0u64;
    let mut present = |result: DetectionResult| {
        displayed += 1;
        let overlay = opts
            .display_stats
            .then(|| overlay_text(&monitor.window_stats(), result.detections.len(), &device));
        if let Err(err) = display.show(&result, overlay.as_deref()) {
            warn!(frame = result.frame.sequence, "display failed: {err:#}");
        }
    };

    info!(buffer_size = pipeline.capacity(), "starting real-time detection");
    let reason = loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("shutdown requested, stopping capture");
            break StopReason::Shutdown;
        }
        if opts.max_frames.is_some_and(|max| captured >= max) {
            break StopReason::FrameLimit;
        }

        match source.read() {
            Ok(Some(frame)) => {
                captured += 1;
                debug!(frame = frame.sequence, "captured");
                pipeline.submit(frame);
            }
            Ok(None) => {
                info!("end of stream after {captured} frames");
                break StopReason::EndOfStream;
            }
            Err(err) => {
                error!("capture failed: {err}");
                pipeline.stop();
                return Err(err).context("Frame capture failed");
            }
        }

        while let Some(result) = pipeline.take() {
            present(result);
        }
    };

    if reason != StopReason::Shutdown {
        let deadline = Instant::now() + DRAIN_GRACE;
        loop {
            let stats = pipeline.stats();
            let accepted = stats.submitted - stats.dropped;
            if stats.processed + stats.failed >= accepted && pipeline.ready() == 0 {
                break;
            }
            if Instant::now() >= deadline || shutdown.load(Ordering::SeqCst) {
                warn!("giving up on {} queued frames", pipeline.queued());
                break;
            }
            if let Some(result) = pipeline.take_timeout(Duration::from_millis(20)) {
                present(result);
            }
        }
    }

    pipeline.stop();
    Ok(SessionSummary {
        reason,
        frames_captured: captured,
        frames_displayed: displayed,
        pipeline: pipeline.stats(),
        stats: monitor.window_stats(),
        device,
        elapsed: started.elapsed(),
    })
}

/// Run the detection pipeline described by `config` until the stream ends or
/// Ctrl+C is pressed.
pub fn run(config: VisionConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry = telemetry::enter_runtime(&config.telemetry);
    if let Some(addr) = config.telemetry.metrics_addr {
        telemetry::install_prometheus(addr)?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler({
            let handler_shutdown = handler_shutdown.clone();
            move || {
                handler_shutdown.store(true, Ordering::SeqCst);
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let mut source = video_ingest::open_source(&config.source, (config.width, config.height))
        .with_context(|| format!("Failed to open capture source {}", config.source))?;
    info!("capturing from {}", source.describe());

    let monitor = Arc::new(
        PerformanceMonitor::new(config.window_size)
            .with_accelerator_probe(NvidiaSmiProbe)
            .with_system_probe(ProcSystemProbe::default()),
    );

    let sink = if config.enable_monitoring {
        Some(Arc::new(JsonFileSink::new(&config.results_path).with_context(|| {
            format!(
                "Failed to prepare results directory {}",
                config.results_path.display()
            )
        })?))
    } else {
        None
    };

    let mut display = LogDisplay::default();
    let opts = SessionOptions::from_config(&config);

    let summary = match config.backend {
        BackendKind::Null => {
            info!("using null backend; frames are not analysed");
            launch(
                &config,
                &mut *source,
                NullBackend,
                &mut display,
                monitor,
                sink,
                &opts,
                &shutdown,
            )?
        }
        #[cfg(feature = "with-tch")]
        BackendKind::Torch => {
            let model_path = config
                .model_path
                .as_deref()
                .context("Missing model path for torch backend")?;
            let backend = crate::pipeline::backend::TorchBackend::load(
                model_path,
                config.use_cpu,
                (i64::from(config.width), i64::from(config.height)),
                config.conf_threshold,
            )?;
            info!("detector initialised from {}", model_path.display());
            launch(
                &config,
                &mut *source,
                backend,
                &mut display,
                monitor,
                sink,
                &opts,
                &shutdown,
            )?
        }
        #[cfg(not(feature = "with-tch"))]
        BackendKind::Torch => {
            anyhow::bail!("Torch backend requested but rt-detect was built without `with-tch`")
        }
    };

    summary.log();
    Ok(())
}

/// Wrap the backend with tracking if enabled, start monitoring, run the session.
#[allow(clippy::too_many_arguments)]
fn launch<B>(
    config: &VisionConfig,
    source: &mut dyn FrameSource,
    backend: B,
    display: &mut dyn FrameDisplay,
    monitor: Arc<PerformanceMonitor>,
    sink: Option<Arc<JsonFileSink>>,
    opts: &SessionOptions,
    shutdown: &AtomicBool,
) -> Result<SessionSummary>
where
    B: InferenceBackend + 'static,
{
    let mut scheduler = match sink {
        Some(sink) => {
            info!(
                "saving metrics to {} every {:.2}s",
                sink.dir().display(),
                config.monitoring_interval.as_secs_f64()
            );
            let mut scheduler =
                MonitoringScheduler::new(monitor.clone(), sink, config.monitoring_interval);
            scheduler
                .start()
                .context("Failed to start monitoring thread")?;
            Some(scheduler)
        }
        None => None,
    };

    let result = if config.tracking {
        let tracked = Tracked::new(backend, IouTracker::default());
        run_session(source, tracked, display, monitor, opts, shutdown)
    } else {
        run_session(source, backend, display, monitor, opts, shutdown)
    };

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.stop();
    }
    result
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use ml_core::Detection;
    use video_ingest::{CaptureError, Frame, SyntheticSource};

    use super::*;

    fn opts(max_frames: Option<u64>) -> SessionOptions {
        SessionOptions {
            buffer_size: 4,
            display_stats: true,
            max_frames,
        }
    }

    #[test]
    fn session_runs_to_end_of_stream() {
        let mut source = SyntheticSource::new((16, 12), Some(25)).unwrap();
        let backend = |frame: &Frame| -> Result<Vec<Detection>> {
            Ok(vec![Detection::new([0.0, 0.0, 4.0, 4.0], 0.9, frame.sequence as i64 % 3)])
        };
        let mut overlays = Vec::new();
        let mut display = |result: &DetectionResult, overlay: Option<&str>| -> Result<()> {
            assert_eq!(result.detections.len(), 1);
            overlays.push(overlay.map(str::to_string));
            Ok(())
        };
        let monitor = Arc::new(PerformanceMonitor::new(8));
        let shutdown = AtomicBool::new(false);

        let summary =
            run_session(&mut source, backend, &mut display, monitor, &opts(None), &shutdown).unwrap();

        assert_eq!(summary.reason, StopReason::EndOfStream);
        assert_eq!(summary.frames_captured, 25);
        assert_eq!(
            summary.pipeline.processed + summary.pipeline.dropped,
            25
        );
        assert_eq!(summary.frames_displayed, summary.pipeline.processed);
        assert_eq!(overlays.len() as u64, summary.frames_displayed);
        assert!(overlays.iter().all(|text| {
            text.as_deref()
                .is_some_and(|text| text.contains("Objects: 1") && text.contains("Device: cpu"))
        }));
    }

    #[test]
    fn frame_limit_stops_capture() {
        let mut source = SyntheticSource::new((8, 8), None).unwrap();
        let mut display = LogDisplay::new(1);
        let summary = run_session(
            &mut source,
            NullBackend,
            &mut display,
            Arc::new(PerformanceMonitor::new(8)),
            &opts(Some(10)),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(summary.reason, StopReason::FrameLimit);
        assert_eq!(summary.frames_captured, 10);
        assert_eq!(summary.device, "none");
    }

    #[test]
    fn raised_shutdown_flag_stops_immediately() {
        let mut source = SyntheticSource::new((8, 8), None).unwrap();
        let mut display = LogDisplay::default();
        let summary = run_session(
            &mut source,
            NullBackend,
            &mut display,
            Arc::new(PerformanceMonitor::new(8)),
            &opts(None),
            &AtomicBool::new(true),
        )
        .unwrap();
        assert_eq!(summary.reason, StopReason::Shutdown);
        assert_eq!(summary.frames_captured, 0);
    }

    struct BrokenSource {
        reads: u32,
    }

    impl FrameSource for BrokenSource {
        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            self.reads += 1;
            Err(CaptureError::Other(anyhow!("camera unplugged")))
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    #[test]
    fn capture_failure_is_returned() {
        let mut source = BrokenSource { reads: 0 };
        let mut display = LogDisplay::default();
        let err = run_session(
            &mut source,
            NullBackend,
            &mut display,
            Arc::new(PerformanceMonitor::new(8)),
            &opts(None),
            &AtomicBool::new(false),
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("camera unplugged"));
        assert_eq!(source.reads, 1);
    }

    #[test]
    fn display_errors_do_not_end_the_session() {
        let mut source = SyntheticSource::new((8, 8), Some(5)).unwrap();
        let mut display = |_: &DetectionResult, _: Option<&str>| -> Result<()> {
            Err(anyhow!("window closed"))
        };
        let summary = run_session(
            &mut source,
            NullBackend,
            &mut display,
            Arc::new(PerformanceMonitor::new(8)),
            &opts(None),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(summary.reason, StopReason::EndOfStream);
        assert_eq!(summary.frames_captured, 5);
    }
}
