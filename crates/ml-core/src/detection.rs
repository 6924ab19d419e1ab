use serde::Serialize;

/// Single detection produced by a backend, optionally tagged by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Corner coordinates `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f32; 4],
    /// Confidence in `[0, 1]`.
    pub score: f32,
    pub class_id: i64,
    /// Assigned by the tracker once the detection has been associated.
    pub track_id: Option<u64>,
}

impl Detection {
    /// Build a detection from corner coordinates. Scores outside `[0, 1]` are
    /// clamped; NaN becomes 0.
    pub fn new(bbox: [f32; 4], score: f32, class_id: i64) -> Self {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        let [x1, y1, x2, y2] = bbox;
        Self {
            bbox: [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)],
            score,
            class_id,
            track_id: None,
        }
    }

    /// Build a detection from YOLO style centre/size coordinates.
    pub fn from_center_xywh(xywh: [f32; 4], score: f32, class_id: i64) -> Self {
        let [cx, cy, w, h] = xywh;
        Self::new(
            [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class_id,
        )
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        iou(&self.bbox, &other.bbox)
    }
}

/// Intersection over union of two corner boxes; 0 for degenerate input.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let left = a[0].max(b[0]);
    let top = a[1].max(b[1]);
    let right = a[2].min(b[2]);
    let bottom = a[3].min(b[3]);
    let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 { 0.0 } else { intersection / union }
}

/// Detections for a single frame.
#[derive(Debug, Clone, Default)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_are_clamped_into_unit_range() {
        assert_eq!(Detection::new([0.0, 0.0, 1.0, 1.0], 1.7, 0).score, 1.0);
        assert_eq!(Detection::new([0.0, 0.0, 1.0, 1.0], -0.2, 0).score, 0.0);
        assert_eq!(Detection::new([0.0, 0.0, 1.0, 1.0], f32::NAN, 0).score, 0.0);
    }

    #[test]
    fn corners_are_normalised() {
        let det = Detection::new([10.0, 20.0, 0.0, 5.0], 0.5, 1);
        assert_eq!(det.bbox, [0.0, 5.0, 10.0, 20.0]);
    }

    #[test]
    fn center_boxes_convert_to_corners() {
        let det = Detection::from_center_xywh([50.0, 40.0, 20.0, 10.0], 0.9, 2);
        assert_eq!(det.bbox, [40.0, 35.0, 60.0, 45.0]);
        assert_eq!(det.area(), 200.0);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        let half = iou(&a, &[5.0, 0.0, 15.0, 10.0]);
        assert!((half - 1.0 / 3.0).abs() < 1e-6);
    }
}
