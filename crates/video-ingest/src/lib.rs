//! Frame sources feeding the detection pipeline.
//!
//! Sources are pull based: the capture loop calls [`FrameSource::read`] and
//! decides itself what to do with each frame, so backpressure policy lives in
//! the pipeline rather than in the reader.

mod ffmpeg;
mod synthetic;
mod types;

pub use ffmpeg::FfmpegSource;
pub use synthetic::{SYNTHETIC_SCHEME, SyntheticSource};
pub use types::{CaptureError, Frame, FrameFormat, FrameSource};

/// Open the source matching `uri`, scaling frames to `target_size`.
///
/// `synthetic:<count>` selects the built-in generator; anything else is
/// handed to ffmpeg (device index, file path, RTSP/HTTP URL).
pub fn open_source(uri: &str, target_size: (i32, i32)) -> Result<Box<dyn FrameSource>, CaptureError> {
    if let Some(synthetic) = SyntheticSource::from_uri(uri, target_size) {
        return Ok(Box::new(synthetic?));
    }
    Ok(Box::new(FfmpegSource::open(uri, target_size)?))
}
