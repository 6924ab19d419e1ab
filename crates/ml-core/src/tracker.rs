//! IoU based multi-object tracker.
//!
//! Detections are greedily associated with existing tracks of the same class
//! by descending overlap. Unmatched detections open new tracks; tracks that go
//! unmatched for more than `max_lost` consecutive frames are retired. Track
//! identifiers start at 1, increase monotonically and are never reused.

use crate::detection::{Detection, iou};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MAX_LOST: u32 = 30;

#[derive(Debug, Clone)]
struct Track {
    id: u64,
    bbox: [f32; 4],
    class_id: i64,
    lost: u32,
}

#[derive(Debug)]
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: u64,
    iou_threshold: f32,
    max_lost: u32,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_LOST)
    }
}

impl IouTracker {
    pub fn new(iou_threshold: f32, max_lost: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold: iou_threshold.clamp(0.0, 1.0),
            max_lost,
        }
    }

    /// Number of tracks currently alive (matched or within the lost budget).
    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Associate `detections` with known tracks, writing `track_id` in place.
    pub fn update(&mut self, detections: &mut [Detection]) {
        let mut candidates = Vec::new();
        for (track_idx, track) in self.tracks.iter().enumerate() {
            for (det_idx, det) in detections.iter().enumerate() {
                if det.class_id != track.class_id {
                    continue;
                }
                let overlap = iou(&track.bbox, &det.bbox);
                if overlap >= self.iou_threshold && overlap > 0.0 {
                    candidates.push((overlap, track_idx, det_idx));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (_, track_idx, det_idx) in candidates {
            if track_matched[track_idx] || det_matched[det_idx] {
                continue;
            }
            track_matched[track_idx] = true;
            det_matched[det_idx] = true;
            let track = &mut self.tracks[track_idx];
            track.bbox = detections[det_idx].bbox;
            track.lost = 0;
            detections[det_idx].track_id = Some(track.id);
        }

        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if !matched {
                track.lost = track.lost.saturating_add(1);
            }
        }
        let max_lost = self.max_lost;
        self.tracks.retain(|track| track.lost <= max_lost);

        for (det, matched) in detections.iter_mut().zip(det_matched) {
            if matched {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            det.track_id = Some(id);
            self.tracks.push(Track {
                id,
                bbox: det.bbox,
                class_id: det.class_id,
                lost: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, class_id: i64) -> Detection {
        Detection::new([x, 0.0, x + 10.0, 10.0], 0.9, class_id)
    }

    #[test]
    fn moving_object_keeps_its_identifier() {
        let mut tracker = IouTracker::default();
        let mut ids = Vec::new();
        for step in 0..5 {
            let mut frame = vec![boxed(step as f32 * 2.0, 0)];
            tracker.update(&mut frame);
            ids.push(frame[0].track_id);
        }
        assert!(ids.iter().all(|id| *id == Some(1)));
        assert_eq!(tracker.active_tracks(), 1);
    }

    #[test]
    fn distinct_objects_get_distinct_monotonic_ids() {
        let mut tracker = IouTracker::default();
        let mut frame = vec![boxed(0.0, 0), boxed(100.0, 0), boxed(200.0, 1)];
        tracker.update(&mut frame);
        let ids: Vec<_> = frame.iter().map(|d| d.track_id.unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn class_mismatch_is_not_associated() {
        let mut tracker = IouTracker::default();
        let mut first = vec![boxed(0.0, 0)];
        tracker.update(&mut first);
        let mut second = vec![boxed(0.0, 1)];
        tracker.update(&mut second);
        assert_ne!(first[0].track_id, second[0].track_id);
    }

    #[test]
    fn lost_tracks_expire_and_ids_are_not_reused() {
        let mut tracker = IouTracker::new(0.3, 2);
        let mut frame = vec![boxed(0.0, 0)];
        tracker.update(&mut frame);
        assert_eq!(frame[0].track_id, Some(1));

        for _ in 0..2 {
            tracker.update(&mut []);
        }
        assert_eq!(tracker.active_tracks(), 1, "still within lost budget");
        tracker.update(&mut []);
        assert_eq!(tracker.active_tracks(), 0);

        let mut again = vec![boxed(0.0, 0)];
        tracker.update(&mut again);
        assert_eq!(again[0].track_id, Some(2));
    }

    #[test]
    fn object_reacquired_within_budget_keeps_id() {
        let mut tracker = IouTracker::new(0.3, 3);
        let mut frame = vec![boxed(0.0, 0)];
        tracker.update(&mut frame);
        tracker.update(&mut []);
        let mut back = vec![boxed(1.0, 0)];
        tracker.update(&mut back);
        assert_eq!(back[0].track_id, Some(1));
    }
}
