//! Detection output as seen by the reducer.
//!
//! Detections and their landmarks are produced by the external inference and
//! decoding stages. The reducer borrows them for a single frame and never
//! retains them past the callback.

mod landmarks;
mod result;

pub use landmarks::{Keypoint, Landmark, LandmarkSet};
pub use result::{decode_detections, BoundingBox, DecodeReport, Detection, TRACKED_CLASS};
