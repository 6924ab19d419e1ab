//! Two-stage bounded hand-off between capture, inference and display.
//!
//! ```text
//! capture ──submit──▶ [to_infer; C] ──worker: infer()──▶ [to_display; C] ──take──▶ display
//!          (drop newest when full)          (blocks when full)           (never blocks)
//! ```
//!
//! A frame dropped on submit never reaches the worker, and the worker never
//! reorders, so the display sees a strict subsequence of capture order.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use ml_core::Detection;
use thiserror::Error;
use tracing::{debug, error, warn};
use video_ingest::Frame;

use crate::pipeline::{backend::InferenceBackend, monitor::PerformanceMonitor, telemetry};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline buffer size must be at least 1")]
    InvalidCapacity,
    #[error("failed to spawn inference worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A frame paired with what the backend found in it.
#[derive(Debug)]
pub struct DetectionResult {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// The inference queue was full; the submitted frame was discarded.
    Dropped,
    /// The pipeline has been stopped; nothing was enqueued.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Dequeuing = 1,
    Inferring = 2,
    Publishing = 3,
    Stopped = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Dequeuing,
            2 => WorkerState::Inferring,
            3 => WorkerState::Publishing,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub dropped: u64,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

enum WorkItem {
    Frame(Frame),
    Poison,
}

pub struct BoundedPipeline {
    capacity: usize,
    to_infer: Sender<WorkItem>,
    backlog: Receiver<WorkItem>,
    to_display: Receiver<DetectionResult>,
    worker: Option<thread::JoinHandle<()>>,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
    stopped: bool,
}

impl BoundedPipeline {
    /// Create both queues with `capacity` slots and spawn the inference worker.
    pub fn start<B>(
        capacity: usize,
        backend: B,
        monitor: Arc<PerformanceMonitor>,
    ) -> Result<Self, PipelineError>
    where
        B: InferenceBackend + 'static,
    {
        if capacity == 0 {
            return Err(PipelineError::InvalidCapacity);
        }

        let (to_infer, work_rx) = bounded::<WorkItem>(capacity);
        let (result_tx, to_display) = bounded::<DetectionResult>(capacity);
        let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
        let counters = Arc::new(Counters::default());

        let backlog = work_rx.clone();
        let worker = {
            let state = state.clone();
            let counters = counters.clone();
            telemetry::spawn_thread("vision-infer", move || {
                worker_loop(backend, work_rx, result_tx, monitor, state, counters)
            })?
        };

        Ok(Self {
            capacity,
            to_infer,
            backlog,
            to_display,
            worker: Some(worker),
            state,
            counters,
            stopped: false,
        })
    }

    /// Offer a frame to the worker without blocking.
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        if self.stopped {
            return SubmitOutcome::Stopped;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let sequence = frame.sequence;
        let outcome = match self.to_infer.try_send(WorkItem::Frame(frame)) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("vision_capture_dropped_frames_total").increment(1);
                debug!(
                    frame = sequence,
                    dropped_total = dropped,
                    "inference queue full, dropping frame"
                );
                SubmitOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(frame = sequence, "inference worker is gone, discarding frame");
                SubmitOutcome::Stopped
            }
        };
        metrics::gauge!("vision_queue_depth", "queue" => "inference").set(self.to_infer.len() as f64);
        outcome
    }

    /// Next finished result, if one is ready.
    pub fn take(&self) -> Option<DetectionResult> {
        self.to_display.try_recv().ok()
    }

    /// Wait up to `timeout` for the next finished result.
    pub fn take_timeout(&self, timeout: Duration) -> Option<DetectionResult> {
        self.to_display.recv_timeout(timeout).ok()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames waiting for the worker.
    pub fn queued(&self) -> usize {
        self.to_infer.len()
    }

    /// Results waiting for the display.
    pub fn ready(&self) -> usize {
        self.to_display.len()
    }

    pub fn worker_state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Shut the worker down and wait for it to exit.
    ///
    /// Frames still waiting for inference are discarded, the poison sentinel is
    /// queued behind the frame in flight, and unclaimed results are drained so
    /// a worker blocked on a full display queue can reach the sentinel.
    /// Calling this more than once is a no-op.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let Some(worker) = self.worker.take() else {
            return;
        };

        let mut discarded_frames = 0usize;
        while let Ok(item) = self.backlog.try_recv() {
            if matches!(item, WorkItem::Frame(_)) {
                discarded_frames += 1;
            }
        }
        if self.to_infer.send(WorkItem::Poison).is_err() {
            debug!("inference worker already exited before shutdown");
        }

        let mut discarded_results = 0usize;
        loop {
            match self.to_display.recv_timeout(Duration::from_millis(50)) {
                Ok(_) => discarded_results += 1,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if worker.join().is_err() {
            error!("inference worker panicked during shutdown");
        }
        self.state.store(WorkerState::Stopped as u8, Ordering::Release);
        debug!(
            discarded_frames,
            discarded_results, "inference pipeline stopped"
        );
    }
}

impl Drop for BoundedPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<B: InferenceBackend>(
    mut backend: B,
    work_rx: Receiver<WorkItem>,
    result_tx: Sender<DetectionResult>,
    monitor: Arc<PerformanceMonitor>,
    state: Arc<AtomicU8>,
    counters: Arc<Counters>,
) {
    let set = |next: WorkerState| state.store(next as u8, Ordering::Release);

    loop {
        set(WorkerState::Dequeuing);
        let frame = match work_rx.recv() {
            Ok(WorkItem::Frame(frame)) => frame,
            Ok(WorkItem::Poison) => break,
            Err(_) => break,
        };

        set(WorkerState::Inferring);
        let sequence = frame.sequence;
        let outcome = {
            let _timer = monitor.scoped_measure();
            catch_unwind(AssertUnwindSafe(|| backend.infer(&frame)))
        };

        match outcome {
            Ok(Ok(detections)) => {
                set(WorkerState::Publishing);
                if result_tx.send(DetectionResult { frame, detections }).is_err() {
                    debug!("display queue closed, stopping inference worker");
                    break;
                }
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vision_inference_failures_total").increment(1);
                warn!(frame = sequence, "inference failed: {err:#}");
            }
            Err(payload) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("vision_inference_failures_total").increment(1);
                error!(frame = sequence, "inference panicked: {}", panic_message(&*payload));
            }
        }
        set(WorkerState::Idle);
    }

    set(WorkerState::Stopped);
    debug!("inference worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
