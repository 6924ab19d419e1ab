use std::{convert::TryFrom, path::Path};

use anyhow::{Result, bail};
use tch::{self, Device, Kind, Tensor};

use crate::detection::{Detection, DetectionBatch};

/// Upper bound on detections kept per frame.
const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed YOLO style detector.
///
/// The module is expected to emit `[1, C, N]` predictions with rows of
/// `(cx, cy, w, h, conf[, class])` in detector input pixels.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
}

impl TorchDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, device: Device, input_size: (i64, i64)) -> Result<Self> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
        })
    }

    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn input_size(&self) -> (i64, i64) {
        self.input_size
    }

    /// Convert a packed BGR8 buffer into a normalised NCHW RGB tensor.
    pub fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Result<Tensor> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                bgr.len(),
                expected
            );
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .view([height as i64, width as i64, 3])
            .flip([2])
            .permute([2, 0, 1])
            .to_kind(Kind::Float)
            .unsqueeze(0)
            / 255.0;

        if (width as i64, height as i64) == (in_w, in_h) {
            Ok(tensor)
        } else {
            Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None::<f64>, None::<f64>))
        }
    }

    /// Run the module and keep predictions above the confidence threshold,
    /// rescaled into frame coordinates.
    pub fn detect(&self, bgr: &[u8], width: i32, height: i32) -> Result<DetectionBatch> {
        let input = self.bgr_to_tensor(bgr, width, height)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,conf), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = width as f32 / in_w.max(1) as f32;
        let scale_y = height as f32 / in_h.max(1) as f32;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < 5 || row[4] < self.confidence_threshold {
                continue;
            }
            let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
            detections.push(Detection::from_center_xywh(
                [row[0] * scale_x, row[1] * scale_y, row[2] * scale_x, row[3] * scale_y],
                row[4],
                class_id,
            ));
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }

        Ok(DetectionBatch { detections })
    }
}
