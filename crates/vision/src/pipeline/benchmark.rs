//! Offline latency and throughput measurement for detection backends.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span};
use video_ingest::{Frame, FrameSource, SyntheticSource};

use crate::pipeline::{
    backend::{InferenceBackend, NullBackend},
    config::{BackendKind, BenchmarkConfig},
    sink::write_json_unique,
    telemetry,
    window::RollingWindow,
};

/// Latency distribution over the timed iterations, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub iterations: usize,
    pub mean_time: f64,
    pub std_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputReport {
    pub frames_processed: u64,
    /// Seconds.
    pub total_time: f64,
    /// Frames per second.
    pub throughput: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeReport {
    pub inference: BenchmarkReport,
    pub throughput: ThroughputReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkSuite {
    pub device: String,
    /// Keyed by `WIDTHxHEIGHT`.
    pub benchmarks: BTreeMap<String, SizeReport>,
}

/// Run `warmup` untimed and `iterations` timed inferences on `frame`.
pub fn run_benchmark<B>(
    backend: &mut B,
    frame: &Frame,
    warmup: usize,
    iterations: usize,
) -> Result<BenchmarkReport>
where
    B: InferenceBackend + ?Sized,
{
    if iterations == 0 {
        bail!("benchmark needs at least one iteration");
    }
    for _ in 0..warmup {
        backend.infer(frame).context("warmup inference failed")?;
    }

    let mut times = RollingWindow::new(iterations);
    for iteration in 0..iterations {
        let started = Instant::now();
        backend
            .infer(frame)
            .with_context(|| format!("inference failed on iteration {iteration}"))?;
        times.push(started.elapsed().as_secs_f64());
    }

    let mean_time = times.mean();
    Ok(BenchmarkReport {
        iterations,
        mean_time,
        std_time: times.std(),
        min_time: times.min(),
        max_time: times.max(),
        fps: if mean_time > 0.0 { 1.0 / mean_time } else { 0.0 },
    })
}

/// Run inference back to back on `frame` for at least `duration`.
pub fn measure_throughput<B>(
    backend: &mut B,
    frame: &Frame,
    duration: Duration,
) -> Result<ThroughputReport>
where
    B: InferenceBackend + ?Sized,
{
    let started = Instant::now();
    let mut frames_processed = 0u64;
    while started.elapsed() < duration {
        backend.infer(frame).context("throughput inference failed")?;
        frames_processed += 1;
    }
    let total_time = started.elapsed().as_secs_f64();
    Ok(ThroughputReport {
        frames_processed,
        total_time,
        throughput: frames_processed as f64 / total_time,
    })
}

/// Write `suite` as pretty JSON to `dir/benchmark_results_<timestamp>.json`,
/// never replacing an earlier report.
pub fn save_report(dir: &Path, suite: &BenchmarkSuite) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create benchmark directory {}", dir.display()))?;
    let stem = format!(
        "benchmark_results_{}",
        Utc::now().format("%Y%m%d_%H%M%S_%3f")
    );
    let path = write_json_unique(dir, &stem, suite).context("Failed to write benchmark report")?;
    Ok(path)
}

/// Benchmark every configured input size with one backend.
pub fn run_suite<B>(backend: &mut B, config: &BenchmarkConfig) -> Result<BenchmarkSuite>
where
    B: InferenceBackend + ?Sized,
{
    let mut benchmarks = BTreeMap::new();
    for &(width, height) in &config.input_sizes {
        let key = format!("{width}x{height}");
        let _span = info_span!("benchmark", size = %key).entered();

        let frame = SyntheticSource::new((width, height), Some(1))?
            .read()?
            .context("synthetic source produced no frame")?;

        let inference = run_benchmark(backend, &frame, config.warmup, config.iterations)?;
        info!(
            "{key}: mean {:.2}ms (std {:.2}ms, min {:.2}ms, max {:.2}ms), {:.1} FPS",
            inference.mean_time * 1000.0,
            inference.std_time * 1000.0,
            inference.min_time * 1000.0,
            inference.max_time * 1000.0,
            inference.fps
        );
        let throughput = measure_throughput(backend, &frame, config.throughput_duration)?;
        info!(
            "{key}: {} frames in {:.1}s, {:.1} FPS sustained",
            throughput.frames_processed, throughput.total_time, throughput.throughput
        );
        benchmarks.insert(
            key,
            SizeReport {
                inference,
                throughput,
            },
        );
    }
    Ok(BenchmarkSuite {
        device: backend.device(),
        benchmarks,
    })
}

/// Entry point for the `benchmark` subcommand.
pub fn run(config: BenchmarkConfig) -> Result<()> {
    let _telemetry = telemetry::enter_runtime(&config.telemetry);

    let suite = match config.backend {
        BackendKind::Null => run_suite(&mut NullBackend, &config)?,
        #[cfg(feature = "with-tch")]
        BackendKind::Torch => {
            let model_path = config
                .model_path
                .as_deref()
                .context("Missing model path for torch backend")?;
            let mut suite = BenchmarkSuite {
                device: String::new(),
                benchmarks: BTreeMap::new(),
            };
            for &(width, height) in &config.input_sizes {
                let mut backend = crate::pipeline::backend::TorchBackend::load(
                    model_path,
                    config.use_cpu,
                    (i64::from(width), i64::from(height)),
                    config.conf_threshold,
                )?;
                let single = BenchmarkConfig {
                    input_sizes: vec![(width, height)],
                    ..config.clone()
                };
                let partial = run_suite(&mut backend, &single)?;
                suite.device = partial.device;
                suite.benchmarks.extend(partial.benchmarks);
            }
            suite
        }
        #[cfg(not(feature = "with-tch"))]
        BackendKind::Torch => {
            bail!("Torch backend requested but rt-detect was built without `with-tch`")
        }
    };

    let path = save_report(&config.results_path, &suite)?;
    info!("Benchmark results saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use ml_core::Detection;

    use super::*;

    fn frame() -> Frame {
        SyntheticSource::new((4, 4), Some(1))
            .unwrap()
            .read()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn benchmark_reports_latency_distribution() {
        let calls = AtomicUsize::new(0);
        let mut backend = |_: &Frame| -> Result<Vec<Detection>> {
            calls.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(2));
            Ok(Vec::new())
        };
        let report = run_benchmark(&mut backend, &frame(), 3, 10).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 13);
        assert_eq!(report.iterations, 10);
        assert!(report.min_time >= 0.002);
        assert!(report.min_time <= report.mean_time && report.mean_time <= report.max_time);
        assert!((report.fps - 1.0 / report.mean_time).abs() < 1e-9);
    }

    #[test]
    fn benchmark_propagates_backend_failure() {
        let mut backend =
            |_: &Frame| -> Result<Vec<Detection>> { Err(anyhow::anyhow!("out of memory")) };
        let err = run_benchmark(&mut backend, &frame(), 0, 5).unwrap_err();
        assert!(format!("{err:#}").contains("out of memory"));
        assert!(run_benchmark(&mut NullBackend, &frame(), 0, 0).is_err());
    }

    #[test]
    fn throughput_counts_frames_over_duration() {
        let report =
            measure_throughput(&mut NullBackend, &frame(), Duration::from_millis(50)).unwrap();
        assert!(report.frames_processed > 0);
        assert!(report.total_time >= 0.05);
        assert!(report.throughput > 0.0);
    }

    #[test]
    fn suite_is_saved_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = BenchmarkConfig {
            backend: BackendKind::Null,
            model_path: None,
            use_cpu: true,
            conf_threshold: 0.3,
            input_sizes: vec![(8, 8), (16, 12)],
            warmup: 1,
            iterations: 3,
            throughput_duration: Duration::from_millis(10),
            results_path: dir.path().to_path_buf(),
            telemetry: Default::default(),
        };
        let suite = run_suite(&mut NullBackend, &config).unwrap();
        assert_eq!(suite.device, "none");
        assert_eq!(
            suite.benchmarks.keys().collect::<Vec<_>>(),
            vec!["16x12", "8x8"]
        );

        let path = save_report(dir.path(), &suite).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["benchmarks"]["8x8"]["inference"]["iterations"], 3);
    }

    #[test]
    fn back_to_back_reports_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let suite = BenchmarkSuite {
            device: "none".into(),
            benchmarks: BTreeMap::new(),
        };
        let paths: Vec<_> = (0..3)
            .map(|_| save_report(dir.path(), &suite).unwrap())
            .collect();
        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[1], paths[2]);
        assert_ne!(paths[0], paths[2]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
        for path in paths {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("benchmark_results_") && name.ends_with(".json"));
        }
    }
}
