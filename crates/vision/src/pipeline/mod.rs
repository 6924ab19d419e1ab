//! Real-time detection pipeline with performance telemetry.
//!
//! The module is split into focused submodules:
//! - `bounded`: capture → inference → display hand-off over bounded queues.
//! - `backend`: detection backends run by the inference worker.
//! - `monitor`: FPS and latency windows plus host probe sampling.
//! - `scheduler`: periodic snapshot persistence.
//! - `sink`: metrics record destinations.
//! - `session`: capture loop and process wiring.
//! - `benchmark`: offline latency and throughput runs.
//! - `config`: CLI and YAML configuration parsing.
//! - `telemetry`: tracing subscriber, Chrome trace and Prometheus setup.

pub mod backend;
pub mod benchmark;
pub mod bounded;
pub mod clock;
pub mod config;
pub mod display;
pub mod monitor;
pub mod probes;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod window;

pub use session::run;
