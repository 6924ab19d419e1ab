//! Deterministic in-process frame generator.
//!
//! Used for dry runs without a camera (`synthetic:<count>` URIs) and by the
//! pipeline tests.

use std::{thread, time::Duration};

use chrono::Utc;

use crate::types::{CaptureError, Frame, FrameFormat, FrameSource};

pub const SYNTHETIC_SCHEME: &str = "synthetic:";

pub struct SyntheticSource {
    width: i32,
    height: i32,
    remaining: Option<u64>,
    frame_interval: Option<Duration>,
    next_sequence: u64,
}

impl SyntheticSource {
    /// `frame_count` of `None` produces frames forever.
    pub fn new(size: (i32, i32), frame_count: Option<u64>) -> Result<Self, CaptureError> {
        let (width, height) = size;
        if width <= 0 || height <= 0 {
            return Err(CaptureError::InvalidSize { width, height });
        }
        Ok(Self {
            width,
            height,
            remaining: frame_count,
            frame_interval: None,
            next_sequence: 0,
        })
    }

    /// Pace frame delivery to emulate a camera running at a fixed rate.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Parse `synthetic:<count>` (or bare `synthetic:` for an endless stream).
    pub fn from_uri(uri: &str, size: (i32, i32)) -> Option<Result<Self, CaptureError>> {
        let rest = uri.strip_prefix(SYNTHETIC_SCHEME)?;
        let count = if rest.is_empty() {
            None
        } else {
            match rest.parse::<u64>() {
                Ok(count) => Some(count),
                Err(_) => {
                    return Some(Err(CaptureError::Open {
                        uri: uri.to_string(),
                    }));
                }
            }
        };
        Some(Self::new(size, count))
    }
}

impl FrameSource for SyntheticSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        if let Some(interval) = self.frame_interval {
            thread::sleep(interval);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let shade = (sequence % 256) as u8;
        let pixels = (self.width as usize) * (self.height as usize);
        let mut data = Vec::with_capacity(pixels * FrameFormat::Bgr8.bytes_per_pixel());
        for _ in 0..pixels {
            data.extend_from_slice(&[shade, shade.wrapping_add(85), shade.wrapping_add(170)]);
        }

        Ok(Some(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            sequence,
            format: FrameFormat::Bgr8,
        }))
    }

    fn describe(&self) -> String {
        match self.remaining {
            Some(remaining) => format!("synthetic ({remaining} frames left)"),
            None => "synthetic (endless)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_requested_number_of_frames_then_eof() {
        let mut source = SyntheticSource::new((4, 2), Some(3)).unwrap();
        let mut sequences = Vec::new();
        while let Some(frame) = source.read().unwrap() {
            assert!(frame.is_well_formed());
            sequences.push(frame.sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn uri_parsing() {
        assert!(SyntheticSource::from_uri("rtsp://x", (4, 4)).is_none());
        let mut endless = SyntheticSource::from_uri("synthetic:", (4, 4)).unwrap().unwrap();
        for _ in 0..10 {
            assert!(endless.read().unwrap().is_some());
        }
        assert!(matches!(
            SyntheticSource::from_uri("synthetic:many", (4, 4)),
            Some(Err(CaptureError::Open { .. }))
        ));
    }
}
