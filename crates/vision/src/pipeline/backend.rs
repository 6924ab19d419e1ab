//! Detection backends driven by the pipeline worker.

use anyhow::Result;
use ml_core::{Detection, IouTracker};
use video_ingest::Frame;

/// Synchronous, blocking detector invoked once per frame on the worker thread.
pub trait InferenceBackend: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Label used in logs and the stats overlay.
    fn device(&self) -> String {
        "cpu".to_string()
    }
}

impl<F> InferenceBackend for F
where
    F: FnMut(&Frame) -> Result<Vec<Detection>> + Send,
{
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self(frame)
    }
}

/// Backend that finds nothing; isolates capture and queueing overhead.
#[derive(Debug, Default)]
pub struct NullBackend;

impl InferenceBackend for NullBackend {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if !frame.is_well_formed() {
            anyhow::bail!(
                "malformed frame #{}: {} bytes for {}x{}",
                frame.sequence,
                frame.data.len(),
                frame.width,
                frame.height
            );
        }
        Ok(Vec::new())
    }

    fn device(&self) -> String {
        "none".to_string()
    }
}

/// Runs tracking after detection so both are timed as one inference step.
pub struct Tracked<B> {
    inner: B,
    tracker: IouTracker,
}

impl<B: InferenceBackend> Tracked<B> {
    pub fn new(inner: B, tracker: IouTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<B: InferenceBackend> InferenceBackend for Tracked<B> {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut detections = self.inner.infer(frame)?;
        self.tracker.update(&mut detections);
        Ok(detections)
    }

    fn device(&self) -> String {
        self.inner.device()
    }
}

#[cfg(feature = "with-tch")]
pub use torch::TorchBackend;

#[cfg(feature = "with-tch")]
mod torch {
    use std::path::Path;

    use anyhow::{Context, Result};
    use ml_core::{
        Detection,
        detector::TorchDetector,
        tch::{Cuda, Device},
    };
    use tracing::debug;
    use video_ingest::{Frame, FrameFormat};

    use super::InferenceBackend;

    pub struct TorchBackend {
        detector: TorchDetector,
    }

    impl TorchBackend {
        pub fn load(
            model_path: &Path,
            use_cpu: bool,
            input_size: (i64, i64),
            conf_threshold: f32,
        ) -> Result<Self> {
            let device = if use_cpu {
                Device::Cpu
            } else {
                Device::cuda_if_available()
            };
            debug!(
                "CUDA available: {} (devices: {})",
                Cuda::is_available(),
                Cuda::device_count()
            );
            let detector = TorchDetector::new(model_path, device, input_size)
                .with_context(|| format!("Failed to load model {}", model_path.display()))?
                .with_confidence_threshold(conf_threshold);
            let (width, height) = detector.input_size();
            debug!("model input {width}x{height} on {:?}", detector.device());
            Ok(Self { detector })
        }
    }

    impl InferenceBackend for TorchBackend {
        fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            if !matches!(frame.format, FrameFormat::Bgr8) {
                anyhow::bail!("unsupported frame format");
            }
            let batch = self
                .detector
                .detect(&frame.data, frame.width, frame.height)
                .context("Detector inference failed")?;
            Ok(batch.detections)
        }

        fn device(&self) -> String {
            format!("{:?}", self.detector.device())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_ingest::{FrameFormat, FrameSource, SyntheticSource};

    #[test]
    fn tracked_backend_assigns_persistent_ids() {
        let detect = |_frame: &Frame| -> Result<Vec<Detection>> {
            Ok(vec![Detection::new([10.0, 10.0, 50.0, 50.0], 0.8, 0)])
        };
        let mut backend = Tracked::new(detect, IouTracker::default());
        let mut source = SyntheticSource::new((8, 8), Some(3)).unwrap();
        let mut ids = Vec::new();
        while let Some(frame) = source.read().unwrap() {
            ids.push(backend.infer(&frame).unwrap()[0].track_id);
        }
        assert_eq!(ids, vec![Some(1); 3]);
    }

    #[test]
    fn null_backend_rejects_malformed_frames() {
        let frame = Frame {
            data: vec![0; 5],
            width: 2,
            height: 2,
            timestamp_ms: 0,
            sequence: 7,
            format: FrameFormat::Bgr8,
        };
        assert!(NullBackend.infer(&frame).is_err());
    }
}
