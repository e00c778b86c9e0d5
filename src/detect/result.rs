use serde::Deserialize;

use super::landmarks::LandmarkSet;

/// Class label of the only object the eye follows.
pub const TRACKED_CLASS: &str = "person";

/// Bounding box in frame-normalised `0..1` coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct BoundingBox {
    pub xmin: f32,
    pub ymin: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
        }
    }

    /// Convert a box-relative point to frame-normalised coordinates.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.width + self.xmin, y * self.height + self.ymin)
    }
}

/// One recognised object instance in a frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Pose landmarks, absent when the model produced no pose for this box.
    #[serde(default)]
    pub landmarks: Option<LandmarkSet>,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            label: label.into(),
            bbox,
            confidence,
            landmarks: None,
        }
    }

    pub fn with_landmarks(mut self, landmarks: LandmarkSet) -> Self {
        self.landmarks = Some(landmarks);
        self
    }

    pub fn is_tracked_class(&self) -> bool {
        self.label == TRACKED_CLASS
    }
}

/// Outcome of decoding a serialized detection list.
#[derive(Debug, Default)]
pub struct DecodeReport {
    pub detections: Vec<Detection>,
    /// Elements that were present but could not be decoded.
    pub skipped: usize,
}

/// Decode a JSON array of detections.
///
/// Each element is decoded on its own so that one malformed record only drops
/// that record. A payload that is not an array at all yields no detections.
pub fn decode_detections(payload: &str) -> DecodeReport {
    let items: Vec<serde_json::Value> = match serde_json::from_str(payload) {
        Ok(items) => items,
        Err(e) => {
            log::debug!("detection payload is not a JSON array: {}", e);
            return DecodeReport::default();
        }
    };

    let mut report = DecodeReport::default();
    for item in items {
        match serde_json::from_value::<Detection>(item) {
            Ok(detection) => report.detections.push(detection),
            Err(e) => {
                log::trace!("skipping undecodable detection: {}", e);
                report.skipped += 1;
            }
        }
    }
    report
}
