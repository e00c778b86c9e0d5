//! State shared with the eye-actuation process.
//!
//! The producer (this pipeline) and the consumer (the actuator) map the same
//! block of memory. It holds the latest `GazeTarget` and an opaque config
//! block, both behind one process-shared mutex. Access goes through a narrow
//! API so a reader can never observe `x` from one publish and `y` from
//! another.

#[cfg(unix)]
mod region;

#[cfg(unix)]
pub use region::{SharedState, Snapshot, CONFIG_CAPACITY};

use crate::error::SharedStateError;

/// Latest published gaze coordinate.
///
/// `x` is frame-normalised. `y` is re-mapped from the tracking band and may
/// leave `0..1` when the nose is outside the band.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GazeTarget {
    pub x: f32,
    pub y: f32,
}

impl GazeTarget {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Destination of published gaze targets.
pub trait TargetSink: Send + Sync {
    /// Replace the current target. Both fields change together.
    fn publish(&self, target: GazeTarget) -> Result<(), SharedStateError>;
}

impl<T: TargetSink + ?Sized> TargetSink for std::sync::Arc<T> {
    fn publish(&self, target: GazeTarget) -> Result<(), SharedStateError> {
        (**self).publish(target)
    }
}
