//! Presentation of finished detection results.

use anyhow::Result;
use tracing::{debug, info};

use crate::pipeline::{bounded::DetectionResult, monitor::StatsSnapshot};

/// Single-line stats overlay drawn over (or logged beside) each frame.
pub fn overlay_text(stats: &StatsSnapshot, objects: usize, device: &str) -> String {
    format!(
        "FPS: {:.1} | Processing Time: {:.1}ms | Objects: {objects} | Device: {device}",
        stats.fps,
        stats.processing_time * 1000.0
    )
}

pub trait FrameDisplay {
    /// Present one result. `overlay` is set when stats display is enabled.
    fn show(&mut self, result: &DetectionResult, overlay: Option<&str>) -> Result<()>;
}

impl<F> FrameDisplay for F
where
    F: FnMut(&DetectionResult, Option<&str>) -> Result<()>,
{
    fn show(&mut self, result: &DetectionResult, overlay: Option<&str>) -> Result<()> {
        self(result, overlay)
    }
}

/// Headless display: reports every `every`-th frame at info level and the
/// rest at debug.
#[derive(Debug)]
pub struct LogDisplay {
    every: u64,
    shown: u64,
}

impl LogDisplay {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            shown: 0,
        }
    }

    pub fn shown(&self) -> u64 {
        self.shown
    }
}

impl Default for LogDisplay {
    fn default() -> Self {
        Self::new(30)
    }
}

impl FrameDisplay for LogDisplay {
    fn show(&mut self, result: &DetectionResult, overlay: Option<&str>) -> Result<()> {
        self.shown += 1;
        let frame = result.frame.sequence;
        let objects = result.detections.len();
        if self.shown % self.every == 0 {
            match overlay {
                Some(text) => info!(frame, "{text}"),
                None => info!(frame, objects, "frame displayed"),
            }
        } else {
            debug!(frame, objects, "frame displayed");
        }
        for detection in &result.detections {
            debug!(
                frame,
                class = detection.class_id,
                score = detection.score,
                track = ?detection.track_id,
                bbox = ?detection.bbox,
                "detection"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ml_core::Detection;
    use video_ingest::{Frame, FrameFormat};

    use super::*;

    #[test]
    fn overlay_lists_fps_latency_objects_and_device() {
        let stats = StatsSnapshot {
            fps: 24.96,
            processing_time: 0.0384,
            processing_time_std: 0.0,
            accelerator: None,
            system: None,
        };
        assert_eq!(
            overlay_text(&stats, 3, "cuda:0"),
            "FPS: 25.0 | Processing Time: 38.4ms | Objects: 3 | Device: cuda:0"
        );
    }

    #[test]
    fn log_display_counts_frames() {
        let result = DetectionResult {
            frame: Frame {
                data: vec![0; 3],
                width: 1,
                height: 1,
                timestamp_ms: 0,
                sequence: 4,
                format: FrameFormat::Bgr8,
            },
            detections: vec![Detection::new([0.0, 0.0, 1.0, 1.0], 0.9, 2)],
        };
        let mut display = LogDisplay::new(0);
        display.show(&result, Some("FPS: 1.0")).unwrap();
        display.show(&result, None).unwrap();
        assert_eq!(display.shown(), 2);
    }
}
