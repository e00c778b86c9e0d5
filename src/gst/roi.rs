use std::sync::Once;

use gstreamer as gst;

use crate::detect::{decode_detections, Detection};

/// Name of the custom meta carrying serialized detections.
pub const ROI_META_NAME: &str = "EyeCatcherRoiMeta";

/// Field of the meta structure holding the JSON detection array.
const DETECTIONS_FIELD: &str = "detections";

/// Reads the detections the decoding stage attached to a buffer.
///
/// Implementations must not fail the frame: anything unreadable is dropped
/// and the rest returned.
pub trait RoiReader: Send + Sync + 'static {
    fn read(&self, buffer: &gst::BufferRef) -> Vec<Detection>;
}

/// Reads detections from a `GstCustomMeta` whose structure carries a JSON
/// array in its `detections` field.
#[derive(Debug, Clone)]
pub struct CustomMetaRoiReader {
    name: String,
}

impl CustomMetaRoiReader {
    /// Reader for the default meta name. Requires `gstreamer::init`.
    pub fn new() -> Self {
        Self::with_name(ROI_META_NAME)
    }

    pub fn with_name(name: &str) -> Self {
        if name == ROI_META_NAME {
            static REGISTER: Once = Once::new();
            REGISTER.call_once(|| gst::meta::CustomMeta::register(ROI_META_NAME, &[]));
        }
        Self {
            name: name.to_string(),
        }
    }
}

impl Default for CustomMetaRoiReader {
    fn default() -> Self {
        Self::new()
    }
}

impl RoiReader for CustomMetaRoiReader {
    fn read(&self, buffer: &gst::BufferRef) -> Vec<Detection> {
        let Ok(meta) = gst::meta::CustomMeta::from_buffer(buffer, &self.name) else {
            return Vec::new();
        };
        let payload = match meta.structure().get::<&str>(DETECTIONS_FIELD) {
            Ok(payload) => payload,
            Err(e) => {
                log::trace!("{} without readable {}: {}", self.name, DETECTIONS_FIELD, e);
                return Vec::new();
            }
        };
        let report = decode_detections(payload);
        if report.skipped > 0 {
            log::trace!("dropped {} undecodable detections", report.skipped);
        }
        report.detections
    }
}
