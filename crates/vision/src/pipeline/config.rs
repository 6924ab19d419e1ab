//! Configuration parsing for the detection pipeline and the benchmark runner.
//!
//! CLI arguments are layered over an optional YAML file, which is layered over
//! built-in defaults. The resulting `VisionConfig` is validated once here so
//! downstream stages never re-check it.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use serde::Deserialize;

pub const DEFAULT_CONF_THRESHOLD: f32 = 0.3;
pub const DEFAULT_BUFFER_SIZE: usize = 30;
pub const DEFAULT_WINDOW_SIZE: usize = 30;
pub const DEFAULT_MONITORING_INTERVAL_SECS: f64 = 1.0;
pub const DEFAULT_RESULTS_PATH: &str = "results";
const DEFAULT_SOURCE: &str = "0";
const DEFAULT_SIZE: (i32, i32) = (640, 480);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
/// Detection backend executed by the inference worker.
pub enum BackendKind {
    /// Finds nothing; measures capture and queueing overhead only.
    #[default]
    Null,
    /// TorchScript detector (requires the `with-tch` feature).
    Torch,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and runtime inspection.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct VisionConfig {
    /// Capture URI: V4L index, file, RTSP/HTTP URL or `synthetic:<count>`.
    pub source: String,
    pub backend: BackendKind,
    /// TorchScript model path; required by the torch backend.
    pub model_path: Option<PathBuf>,
    pub width: i32,
    pub height: i32,
    /// Force CPU inference.
    pub use_cpu: bool,
    pub conf_threshold: f32,
    /// Capacity of each pipeline queue.
    pub buffer_size: usize,
    /// Samples kept by each rolling window.
    pub window_size: usize,
    pub display_stats: bool,
    /// Assign persistent track IDs to detections.
    pub tracking: bool,
    pub enable_monitoring: bool,
    pub monitoring_interval: Duration,
    /// Directory receiving metrics records.
    pub results_path: PathBuf,
    /// Stop after this many captured frames.
    pub max_frames: Option<u64>,
    pub telemetry: TelemetryOptions,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            backend: BackendKind::Null,
            model_path: None,
            width: DEFAULT_SIZE.0,
            height: DEFAULT_SIZE.1,
            use_cpu: false,
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            buffer_size: DEFAULT_BUFFER_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            display_stats: true,
            tracking: true,
            enable_monitoring: false,
            monitoring_interval: Duration::from_secs_f64(DEFAULT_MONITORING_INTERVAL_SECS),
            results_path: PathBuf::from(DEFAULT_RESULTS_PATH),
            max_frames: None,
            telemetry: TelemetryOptions::default(),
        }
    }
}

/// YAML configuration file; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub source: Option<String>,
    pub backend: Option<BackendKind>,
    pub model_path: Option<PathBuf>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub use_cpu: Option<bool>,
    pub conf_threshold: Option<f32>,
    pub buffer_size: Option<usize>,
    pub window_size: Option<usize>,
    pub display_stats: Option<bool>,
    pub tracking: Option<bool>,
    pub enable_monitoring: Option<bool>,
    /// Seconds.
    pub monitoring_interval: Option<f64>,
    pub results_path: Option<PathBuf>,
    pub max_frames: Option<u64>,
    pub chrome_trace: Option<PathBuf>,
    pub metrics_addr: Option<SocketAddr>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Default, Args)]
pub struct VisionCliArgs {
    /// Capture URI (V4L index, file, RTSP/HTTP URL or synthetic:<count>).
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,
    /// Capture URI flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// YAML configuration file.
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Detection backend.
    #[arg(long = "backend", value_enum)]
    pub backend: Option<BackendKind>,
    /// TorchScript model path.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<i32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<i32>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Minimum detection confidence (0-1).
    #[arg(long = "conf-threshold", value_name = "SCORE")]
    pub conf_threshold: Option<f32>,
    /// Capacity of each pipeline queue.
    #[arg(long = "buffer-size", value_name = "N")]
    pub buffer_size: Option<usize>,
    /// Samples kept in each rolling statistics window.
    #[arg(long = "window-size", value_name = "N")]
    pub window_size: Option<usize>,
    /// Hide the stats overlay.
    #[arg(long = "no-stats", action = clap::ArgAction::SetTrue)]
    pub no_stats: bool,
    /// Disable persistent track IDs.
    #[arg(long = "no-tracking", action = clap::ArgAction::SetTrue)]
    pub no_tracking: bool,
    /// Periodically persist performance snapshots.
    #[arg(long = "enable-monitoring", action = clap::ArgAction::SetTrue)]
    pub enable_monitoring: bool,
    /// Seconds between persisted snapshots.
    #[arg(long = "monitoring-interval", value_name = "SECS")]
    pub monitoring_interval: Option<f64>,
    /// Directory receiving metrics records.
    #[arg(long = "results", value_name = "DIR")]
    pub results_path: Option<PathBuf>,
    /// Stop after this many captured frames.
    #[arg(long = "max-frames", value_name = "N")]
    pub max_frames: Option<u64>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::layered(args, file)
    }
}

impl VisionConfig {
    /// Merge CLI over file over defaults, then validate.
    pub fn layered(args: VisionCliArgs, file: FileConfig) -> Result<Self> {
        let defaults = Self::default();

        let source = args
            .source_flag
            .or(args.source)
            .or(file.source)
            .unwrap_or(defaults.source);
        if source.trim().is_empty() {
            bail!("Capture source must not be empty");
        }

        let width = args.width.or(file.width).unwrap_or(defaults.width);
        let height = args.height.or(file.height).unwrap_or(defaults.height);
        if width <= 0 || height <= 0 {
            bail!("Capture width and height must be positive integers");
        }

        let backend = args.backend.or(file.backend).unwrap_or(defaults.backend);
        let model_path = args.model_path.or(file.model_path);
        if backend == BackendKind::Torch && model_path.is_none() {
            bail!("Missing model path. Provide --model <path> or `model_path` in the config file.");
        }

        let conf_threshold = args
            .conf_threshold
            .or(file.conf_threshold)
            .unwrap_or(defaults.conf_threshold);
        if !(0.0..=1.0).contains(&conf_threshold) {
            bail!("--conf-threshold must be between 0 and 1");
        }

        let buffer_size = args
            .buffer_size
            .or(file.buffer_size)
            .unwrap_or(defaults.buffer_size);
        if buffer_size == 0 {
            bail!("--buffer-size must be at least 1");
        }

        let window_size = args
            .window_size
            .or(file.window_size)
            .unwrap_or(defaults.window_size);
        if window_size == 0 {
            bail!("--window-size must be at least 1");
        }

        let interval_secs = args
            .monitoring_interval
            .or(file.monitoring_interval)
            .unwrap_or(DEFAULT_MONITORING_INTERVAL_SECS);
        let monitoring_interval = positive_seconds(interval_secs)
            .ok_or_else(|| anyhow!("--monitoring-interval must be a positive number of seconds"))?;

        let display_stats = if args.no_stats {
            false
        } else {
            file.display_stats.unwrap_or(defaults.display_stats)
        };
        let tracking = if args.no_tracking {
            false
        } else {
            file.tracking.unwrap_or(defaults.tracking)
        };

        Ok(Self {
            source,
            backend,
            model_path,
            width,
            height,
            use_cpu: args.use_cpu || file.use_cpu.unwrap_or(defaults.use_cpu),
            conf_threshold,
            buffer_size,
            window_size,
            display_stats,
            tracking,
            enable_monitoring: args.enable_monitoring
                || file.enable_monitoring.unwrap_or(defaults.enable_monitoring),
            monitoring_interval,
            results_path: args
                .results_path
                .or(file.results_path)
                .unwrap_or(defaults.results_path),
            max_frames: args.max_frames.or(file.max_frames),
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace.or(file.chrome_trace),
                metrics_addr: args.metrics_addr.or(file.metrics_addr),
            },
        })
    }
}

fn positive_seconds(secs: f64) -> Option<Duration> {
    (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Parse `WIDTHxHEIGHT`.
pub fn parse_size(text: &str) -> Result<(i32, i32), String> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {text:?}"))?;
    let w: i32 = w.trim().parse().map_err(|_| format!("invalid width {w:?}"))?;
    let h: i32 = h.trim().parse().map_err(|_| format!("invalid height {h:?}"))?;
    if w <= 0 || h <= 0 {
        return Err(format!("size must be positive, got {text:?}"));
    }
    Ok((w, h))
}

#[derive(Clone, Debug)]
/// Offline benchmark settings.
pub struct BenchmarkConfig {
    pub backend: BackendKind,
    pub model_path: Option<PathBuf>,
    pub use_cpu: bool,
    pub conf_threshold: f32,
    /// Frame sizes to benchmark, `(width, height)`.
    pub input_sizes: Vec<(i32, i32)>,
    pub warmup: usize,
    pub iterations: usize,
    /// Length of the sustained-throughput run.
    pub throughput_duration: Duration,
    pub results_path: PathBuf,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `benchmark` subcommand.
#[derive(Debug, Args)]
pub struct BenchmarkCliArgs {
    /// Detection backend.
    #[arg(long = "backend", value_enum, default_value = "null")]
    pub backend: BackendKind,
    /// TorchScript model path.
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Minimum detection confidence (0-1).
    #[arg(long = "conf-threshold", value_name = "SCORE", default_value_t = DEFAULT_CONF_THRESHOLD)]
    pub conf_threshold: f32,
    /// Input size as WIDTHxHEIGHT; repeat for several sizes.
    #[arg(long = "size", value_name = "WxH", value_parser = parse_size, default_values = ["640x640", "1280x1280"])]
    pub sizes: Vec<(i32, i32)>,
    /// Untimed iterations before measuring.
    #[arg(long = "warmup", value_name = "N", default_value_t = 10)]
    pub warmup: usize,
    /// Timed iterations per input size.
    #[arg(long = "iterations", value_name = "N", default_value_t = 100)]
    pub iterations: usize,
    /// Seconds of sustained inference for the throughput figure.
    #[arg(long = "duration", value_name = "SECS", default_value_t = 60.0)]
    pub duration: f64,
    /// Directory receiving the benchmark report.
    #[arg(long = "results", value_name = "DIR", default_value = "results/benchmarks")]
    pub results_path: PathBuf,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<BenchmarkCliArgs> for BenchmarkConfig {
    type Error = anyhow::Error;

    fn try_from(args: BenchmarkCliArgs) -> Result<Self> {
        if args.backend == BackendKind::Torch && args.model_path.is_none() {
            bail!("Missing model path. Provide --model <path> for the torch backend.");
        }
        if !(0.0..=1.0).contains(&args.conf_threshold) {
            bail!("--conf-threshold must be between 0 and 1");
        }
        if args.iterations == 0 {
            bail!("--iterations must be at least 1");
        }
        if args.sizes.is_empty() {
            bail!("At least one --size is required");
        }
        let throughput_duration = positive_seconds(args.duration)
            .ok_or_else(|| anyhow!("--duration must be a positive number of seconds"))?;

        Ok(Self {
            backend: args.backend,
            model_path: args.model_path,
            use_cpu: args.use_cpu,
            conf_threshold: args.conf_threshold,
            input_sizes: args.sizes,
            warmup: args.warmup,
            iterations: args.iterations,
            throughput_duration,
            results_path: args.results_path,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_addr: None,
            },
        })
    }
}
