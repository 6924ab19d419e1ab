//! Detection pipeline, performance monitor and telemetry scheduler.

pub mod pipeline;

/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub use pipeline::config::{
    BackendKind, BenchmarkCliArgs, BenchmarkConfig, TelemetryOptions, VisionCliArgs, VisionConfig,
};
/// Launch the detection pipeline with a ready-made configuration.
pub use pipeline::run;
pub use pipeline::{
    backend::{InferenceBackend, NullBackend, Tracked},
    bounded::{BoundedPipeline, DetectionResult, PipelineError, PipelineStats, SubmitOutcome},
    monitor::{PerformanceMonitor, StatsSnapshot},
    scheduler::MonitoringScheduler,
    session::{SessionOptions, SessionSummary, run_session},
    sink::{JsonFileSink, MemorySink, MetricsRecord, MetricsSink, SinkError},
    window::RollingWindow,
};
