//! FFmpeg-backed capture: decodes any source ffmpeg understands into raw
//! BGR24 frames read from the child's stdout.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, warn};

use crate::types::{CaptureError, Frame, FrameFormat, FrameSource};

/// Frame source pulling raw frames from an `ffmpeg` child process.
pub struct FfmpegSource {
    uri: String,
    child: Child,
    stdout: ChildStdout,
    target_size: (i32, i32),
    frame_bytes: usize,
    next_sequence: u64,
}

impl FfmpegSource {
    /// Spawn ffmpeg for `uri`, scaling every frame to `target_size`.
    pub fn open(uri: &str, target_size: (i32, i32)) -> Result<Self, CaptureError> {
        let (width, height) = target_size;
        if width <= 0 || height <= 0 {
            return Err(CaptureError::InvalidSize { width, height });
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.args(ffmpeg_args(uri, target_size))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                CaptureError::Other(anyhow!("ffmpeg binary not found on PATH"))
            } else {
                CaptureError::Open {
                    uri: uri.to_string(),
                }
            }
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        debug!("ffmpeg capture started for {uri} at {width}x{height}");

        Ok(Self {
            uri: uri.to_string(),
            child,
            stdout,
            target_size,
            frame_bytes: (width as usize) * (height as usize) * FrameFormat::Bgr8.bytes_per_pixel(),
            next_sequence: 0,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut buffer = vec![0u8; self.frame_bytes];
        match self.stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                Ok(Some(Frame {
                    data: buffer,
                    width: self.target_size.0,
                    height: self.target_size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    sequence,
                    format: FrameFormat::Bgr8,
                }))
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("ffmpeg stream {} reached end of input", self.uri);
                Ok(None)
            }
            Err(err) => Err(CaptureError::Io(err)),
        }
    }

    fn describe(&self) -> String {
        format!("ffmpeg:{}", self.uri)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Err(err) = self.child.kill() {
            if err.kind() != ErrorKind::InvalidInput {
                warn!("failed to stop ffmpeg for {}: {err}", self.uri);
            }
        }
        let _ = self.child.wait();
    }
}

/// Build the ffmpeg argument list for a given source URI.
pub(crate) fn ffmpeg_args(uri: &str, target_size: (i32, i32)) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();

    let input = if let Some(index) = parse_device_index(uri) {
        args.extend(["-f", "video4linux2"].map(String::from));
        format!("/dev/video{index}")
    } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        args.extend(
            [
                "-rtsp_transport",
                "tcp",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
            ]
            .map(String::from),
        );
        uri.to_string()
    } else {
        uri.to_string()
    };

    let scale = format!("scale={}:{}", target_size.0, target_size.1);
    args.push("-i".into());
    args.push(input);
    args.extend(
        [
            "-an",
            "-vf",
            scale.as_str(),
            "-pix_fmt",
            "bgr24",
            "-f",
            "rawvideo",
            "-",
        ]
        .map(String::from),
    );
    args
}

/// Interpret `0`, `2` or `/dev/video2` style URIs as V4L device indices.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    uri.strip_prefix("/dev/video")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse::<i32>().ok())
}
