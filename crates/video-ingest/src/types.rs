use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
///
/// Frames are deliberately not `Clone`: a frame has exactly one owner at a
/// time and moves from the source into the pipeline and on to the display.
#[derive(Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    /// Capture order assigned by the source, starting at zero.
    pub sequence: u64,
    pub format: FrameFormat,
}

impl Frame {
    /// Number of bytes a well-formed frame of this geometry carries.
    pub fn expected_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * self.format.bytes_per_pixel()
    }

    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("capture size must be positive, got {width}x{height}")]
    InvalidSize { width: i32, height: i32 },
    #[error("capture read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Pull-based frame producer.
///
/// `Ok(None)` marks end of stream; the capture loop stops on it.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Short human readable description used in log lines.
    fn describe(&self) -> String;
}
