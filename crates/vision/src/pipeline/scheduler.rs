//! Periodic snapshot-and-persist loop running beside the pipeline.

use std::{
    io,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, info, warn};

use crate::pipeline::{
    monitor::PerformanceMonitor,
    sink::{MetricsRecord, MetricsSink, SinkError},
    telemetry,
};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

struct Ticker {
    monitor: Arc<PerformanceMonitor>,
    sink: Arc<dyn MetricsSink>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl Ticker {
    fn tick(&self) -> Result<MetricsRecord, SinkError> {
        let metrics = self.monitor.snapshot();
        let record = MetricsRecord {
            timestamp: self.next_timestamp(),
            metrics,
        };
        self.sink.write(&record)?;
        Ok(record)
    }

    /// Wall-clock time, nudged forward so successive records never tie.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();
        let stamp = match *last {
            Some(previous) if now <= previous => previous + TimeDelta::milliseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }
}

struct Running {
    stop_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Samples the monitor every `interval` and hands the record to a sink.
pub struct MonitoringScheduler {
    ticker: Arc<Ticker>,
    interval: Duration,
    running: Option<Running>,
}

impl MonitoringScheduler {
    pub fn new(
        monitor: Arc<PerformanceMonitor>,
        sink: Arc<dyn MetricsSink>,
        interval: Duration,
    ) -> Self {
        Self {
            ticker: Arc::new(Ticker {
                monitor,
                sink,
                last_timestamp: Mutex::new(None),
            }),
            interval,
            running: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Take one snapshot and persist it.
    pub fn tick(&self) -> Result<MetricsRecord, SinkError> {
        self.ticker.tick()
    }

    /// Spawn the monitoring thread. Does nothing when already running.
    pub fn start(&mut self) -> io::Result<()> {
        if self.running.is_some() {
            debug!("monitoring scheduler already running");
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = self.ticker.clone();
        let interval = self.interval;
        let handle = telemetry::spawn_thread("vision-monitor", move || {
            let mut deadline = Instant::now();
            loop {
                match ticker.tick() {
                    Ok(record) => ticker.monitor.log_stats(&record.metrics),
                    Err(err) => warn!("failed to persist metrics: {err}"),
                }

                deadline += interval;
                let now = Instant::now();
                if deadline < now {
                    debug!(
                        behind_ms = (now - deadline).as_millis() as u64,
                        "monitoring tick overran its interval"
                    );
                    deadline = now;
                }
                match stop_rx.recv_timeout(deadline - now) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("monitoring loop exiting");
        })?;

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "performance monitoring started"
        );
        self.running = Some(Running { stop_tx, handle });
        Ok(())
    }

    /// Signal the monitoring thread and wait for it. Does nothing when idle.
    pub fn stop(&mut self) {
        let Some(Running { stop_tx, handle }) = self.running.take() else {
            return;
        };
        let _ = stop_tx.try_send(());
        drop(stop_tx);
        if handle.join().is_err() {
            error!("monitoring thread panicked");
        }
        info!("performance monitoring stopped");
    }
}

impl Drop for MonitoringScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pipeline::{
        probes::{AcceleratorStats, ProbeError},
        sink::MemorySink,
    };

    fn monitor() -> Arc<PerformanceMonitor> {
        Arc::new(PerformanceMonitor::new(8))
    }

    #[test]
    fn periodic_records_have_increasing_timestamps() {
        let sink = MemorySink::new();
        let mut scheduler =
            MonitoringScheduler::new(monitor(), Arc::new(sink.clone()), Duration::from_millis(100));
        scheduler.start().unwrap();
        assert!(scheduler.is_running());
        thread::sleep(Duration::from_secs(1));
        scheduler.stop();
        assert!(!scheduler.is_running());

        let records = sink.records();
        assert!(
            (8..=11).contains(&records.len()),
            "unexpected record count {}",
            records.len()
        );
        assert!(
            records
                .windows(2)
                .all(|pair| pair[0].timestamp < pair[1].timestamp)
        );
    }

    #[test]
    fn failing_probe_still_produces_record() {
        let monitor = PerformanceMonitor::new(8).with_accelerator_probe(
            || -> Result<Option<AcceleratorStats>, ProbeError> {
                Err(ProbeError::Failed {
                    command: "nvidia-smi",
                    detail: "no devices".into(),
                })
            },
        );
        monitor.record(Duration::from_millis(20));
        let sink = MemorySink::new();
        let scheduler = MonitoringScheduler::new(Arc::new(monitor), Arc::new(sink.clone()), DEFAULT_INTERVAL);

        let record = scheduler.tick().unwrap();
        assert!(record.metrics.accelerator.is_none());
        assert!((record.metrics.processing_time - 0.020).abs() < 1e-9);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn sink_failures_do_not_stop_the_loop() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let sink = {
            let attempts = attempts.clone();
            move |_: &MetricsRecord| -> Result<(), SinkError> {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(SinkError::Io {
                    action: "failed to write",
                    path: "/full/disk".into(),
                    source: io::Error::other("disk full"),
                })
            }
        };
        let mut scheduler = MonitoringScheduler::new(monitor(), Arc::new(sink), Duration::from_millis(20));
        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        scheduler.stop();
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn manual_ticks_never_share_a_timestamp() {
        let scheduler = MonitoringScheduler::new(monitor(), Arc::new(MemorySink::new()), DEFAULT_INTERVAL);
        let stamps: Vec<_> = (0..50).map(|_| scheduler.tick().unwrap().timestamp).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn stop_is_a_no_op_when_idle() {
        let mut scheduler = MonitoringScheduler::new(monitor(), Arc::new(MemorySink::new()), DEFAULT_INTERVAL);
        scheduler.stop();
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn stop_interrupts_a_long_wait() {
        let mut scheduler =
            MonitoringScheduler::new(monitor(), Arc::new(MemorySink::new()), Duration::from_secs(30));
        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        scheduler.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
