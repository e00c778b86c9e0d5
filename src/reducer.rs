//! Per-frame reducer.
//!
//! The media framework calls `FrameObserver::on_frame` once per frame that
//! reaches the callback stage, on its own streaming thread. The reducer turns
//! the frame's person detections into a gaze target and publishes it. It
//! holds no per-frame state after returning and never fails the frame:
//! every problem is confined to the detection that caused it.

use thiserror::Error;

use crate::detect::{BoundingBox, Detection, Keypoint, Landmark, LandmarkSet};
use crate::shared::{GazeTarget, TargetSink};

/// Answer returned to the media framework. The buffer always flows on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Pass,
}

/// Negotiated format of the frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub format: String,
    pub width: u32,
    pub height: u32,
}

/// What the framework hands the observer for one frame.
///
/// Everything is borrowed for the duration of the call only.
#[derive(Clone, Copy, Debug)]
pub struct FrameInput<'a> {
    pub detections: &'a [Detection],
    /// Mapped pixels; only present when the observer asked for them.
    pub pixels: Option<&'a [u8]>,
    /// `None` when the caps could not be determined.
    pub info: Option<&'a FrameInfo>,
}

impl<'a> FrameInput<'a> {
    pub fn new(detections: &'a [Detection], info: &'a FrameInfo) -> Self {
        Self {
            detections,
            pixels: None,
            info: Some(info),
        }
    }

    pub fn with_pixels(mut self, pixels: &'a [u8]) -> Self {
        self.pixels = Some(pixels);
        self
    }
}

/// Callback capability injected into the media pipeline.
pub trait FrameObserver: Send {
    /// Whether the framework should map pixel data for this observer.
    fn wants_pixels(&self) -> bool {
        false
    }

    fn on_frame(&mut self, frame: FrameInput<'_>) -> Ack;
}

/// Why a detection did not produce a target.
#[derive(Debug, Error, PartialEq)]
pub enum DetectionSkip {
    #[error("no landmarks")]
    NoLandmarks,
    #[error("missing {} landmark", .0.name())]
    MissingKeypoint(Keypoint),
    #[error("non-finite landmark or box coordinates")]
    NonFinite,
}

/// Nose and eye points of one pose, in frame-normalised coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseSample {
    pub nose: (f32, f32),
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
}

impl PoseSample {
    pub fn extract(bbox: &BoundingBox, landmarks: &LandmarkSet) -> Result<Self, DetectionSkip> {
        if landmarks.is_empty() {
            return Err(DetectionSkip::NoLandmarks);
        }
        // All three points are required before anything is published.
        let point = |keypoint: Keypoint| -> Result<(f32, f32), DetectionSkip> {
            let lm: &Landmark = landmarks
                .get(keypoint)
                .ok_or(DetectionSkip::MissingKeypoint(keypoint))?;
            Ok(bbox.to_frame(lm.x, lm.y))
        };
        let nose = point(Keypoint::Nose)?;
        let left_eye = point(Keypoint::LeftEye)?;
        let right_eye = point(Keypoint::RightEye)?;
        if !nose.0.is_finite() || !nose.1.is_finite() {
            return Err(DetectionSkip::NonFinite);
        }
        Ok(Self {
            nose,
            left_eye,
            right_eye,
        })
    }
}

/// Maps a frame-normalised nose position to a gaze target.
///
/// `x` is passed through. `y` is taken from the vertical band
/// `[band_top, band_bottom]` and inverted onto `[1, 0]`, without clamping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GazeMapping {
    pub band_top: f32,
    pub band_bottom: f32,
}

impl Default for GazeMapping {
    fn default() -> Self {
        Self {
            band_top: 0.3,
            band_bottom: 0.7,
        }
    }
}

impl GazeMapping {
    pub fn map(&self, nose: (f32, f32)) -> GazeTarget {
        let (x, y_raw) = nose;
        let y = 1.0 - ((y_raw - self.band_top) / (self.band_bottom - self.band_top));
        GazeTarget::new(x, y)
    }
}

/// Process-local frame counter. Never reset during a run.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCounter(u64);

impl FrameCounter {
    pub fn increment(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReducerStats {
    pub frames: u64,
    pub persons: u64,
    pub published: u64,
    pub skipped: u64,
}

/// Publishes the nose position of tracked persons.
///
/// When several persons carry landmarks in one frame each is published in
/// detection order, so the last one is what readers see.
pub struct FrameReducer<S> {
    sink: S,
    mapping: GazeMapping,
    counter: FrameCounter,
    stats: ReducerStats,
    use_frame: bool,
}

impl<S: TargetSink> FrameReducer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            mapping: GazeMapping::default(),
            counter: FrameCounter::default(),
            stats: ReducerStats::default(),
            use_frame: false,
        }
    }

    pub fn with_mapping(mut self, mapping: GazeMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Ask the framework for pixel access on every frame.
    pub fn with_frame_access(mut self, use_frame: bool) -> Self {
        self.use_frame = use_frame;
        self
    }

    pub fn stats(&self) -> ReducerStats {
        self.stats
    }

    pub fn frame_count(&self) -> u64 {
        self.counter.get()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn target_for(&self, detection: &Detection) -> Result<GazeTarget, DetectionSkip> {
        let landmarks = detection
            .landmarks
            .as_ref()
            .ok_or(DetectionSkip::NoLandmarks)?;
        let pose = PoseSample::extract(&detection.bbox, landmarks)?;
        log::trace!(
            "pose nose={:?} left_eye={:?} right_eye={:?}",
            pose.nose,
            pose.left_eye,
            pose.right_eye
        );
        Ok(self.mapping.map(pose.nose))
    }
}

impl<S: TargetSink> FrameObserver for FrameReducer<S> {
    fn wants_pixels(&self) -> bool {
        self.use_frame
    }

    fn on_frame(&mut self, frame: FrameInput<'_>) -> Ack {
        let frame_no = self.counter.increment();
        self.stats.frames = frame_no;

        let Some(info) = frame.info else {
            log::debug!("frame {}: caps unavailable, skipping", frame_no);
            return Ack::Pass;
        };
        if let Some(pixels) = frame.pixels {
            log::trace!(
                "frame {}: {} bytes {} {}x{}",
                frame_no,
                pixels.len(),
                info.format,
                info.width,
                info.height
            );
        }

        for detection in frame.detections.iter().filter(|d| d.is_tracked_class()) {
            self.stats.persons += 1;
            log::debug!(
                "frame {}: {} {:.2}",
                frame_no,
                detection.label,
                detection.confidence
            );

            let target = match self.target_for(detection) {
                Ok(target) => target,
                Err(skip) => {
                    self.stats.skipped += 1;
                    log::trace!("frame {}: detection skipped: {}", frame_no, skip);
                    continue;
                }
            };

            match self.sink.publish(target) {
                Ok(()) => {
                    self.stats.published += 1;
                    log::debug!("frame {}: gaze x={:.3} y={:.3}", frame_no, target.x, target.y);
                }
                Err(e) => log::warn!("frame {}: publish failed: {}", frame_no, e),
            }
        }

        Ack::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SharedStateError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<GazeTarget>>,
    }

    impl RecordingSink {
        fn last(&self) -> Option<GazeTarget> {
            self.published.lock().unwrap().last().copied()
        }

        fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    impl TargetSink for RecordingSink {
        fn publish(&self, target: GazeTarget) -> Result<(), SharedStateError> {
            self.published.lock().unwrap().push(target);
            Ok(())
        }
    }

    fn info() -> FrameInfo {
        FrameInfo {
            format: "RGB".to_string(),
            width: 640,
            height: 640,
        }
    }

    fn person(bbox: BoundingBox, nose: (f32, f32)) -> Detection {
        Detection::new("person", bbox, 0.9).with_landmarks(LandmarkSet::from_points([
            nose,
            (0.4, 0.1),
            (0.6, 0.1),
        ]))
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn published_target_follows_nose_formula() {
        let info = info();
        let mut reducer = FrameReducer::new(RecordingSink::default());
        for &(xmin, ymin, w, h) in &[
            (0.0, 0.0, 1.0, 1.0),
            (0.1, 0.2, 0.3, 0.4),
            (0.5, 0.05, 0.25, 0.9),
        ] {
            for &(nx, ny) in &[(0.0, 0.0), (0.5, 0.5), (1.0, 1.0), (0.25, 0.8)] {
                let bbox = BoundingBox::new(xmin, ymin, w, h);
                let detections = [person(bbox, (nx, ny))];
                assert_eq!(reducer.on_frame(FrameInput::new(&detections, &info)), Ack::Pass);

                let got = reducer.sink().last().expect("published");
                let y_raw = ny * h + ymin;
                assert!(close(got.x, nx * w + xmin));
                assert!(close(got.y, 1.0 - ((y_raw - 0.3) / 0.4)));
            }
        }
    }

    #[test]
    fn y_is_not_clamped_outside_tracking_band() {
        let mapping = GazeMapping::default();
        assert!(close(mapping.map((0.5, 0.3)).y, 1.0));
        assert!(close(mapping.map((0.5, 0.7)).y, 0.0));
        assert!(close(mapping.map((0.5, 0.5)).y, 0.5));
        assert!(close(mapping.map((0.5, 0.1)).y, 1.5));
        assert!(close(mapping.map((0.5, 0.9)).y, -0.5));
    }

    #[test]
    fn frames_without_persons_leave_target_untouched() {
        let info = info();
        let mut reducer = FrameReducer::new(RecordingSink::default());
        let first = [person(BoundingBox::new(0.0, 0.0, 1.0, 1.0), (0.2, 0.5))];
        reducer.on_frame(FrameInput::new(&first, &info));
        let before = reducer.sink().last();

        let others = [
            Detection::new("dog", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 0.8)
                .with_landmarks(LandmarkSet::from_points([(0.9, 0.9)])),
            Detection::new("car", BoundingBox::new(0.1, 0.1, 0.2, 0.2), 0.7),
        ];
        reducer.on_frame(FrameInput::new(&others, &info));
        reducer.on_frame(FrameInput::new(&[], &info));

        assert_eq!(reducer.sink().last(), before);
        assert_eq!(reducer.sink().count(), 1);
        assert_eq!(reducer.frame_count(), 3);
    }

    #[test]
    fn last_matching_person_wins() {
        let info = info();
        let mut reducer = FrameReducer::new(RecordingSink::default());
        let full = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let detections = [
            person(full, (0.1, 0.5)),
            person(full, (0.4, 0.5)),
            Detection::new("person", full, 0.6),
            person(full, (0.8, 0.4)),
        ];

        for _ in 0..3 {
            reducer.on_frame(FrameInput::new(&detections, &info));
            let got = reducer.sink().last().expect("published");
            assert!(close(got.x, 0.8));
            assert!(close(got.y, 0.75));
        }
    }

    #[test]
    fn bad_landmarks_skip_only_their_detection() {
        let info = info();
        let mut reducer = FrameReducer::new(RecordingSink::default());
        let full = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let detections = [
            person(full, (0.3, 0.5)),
            Detection::new("person", full, 0.5).with_landmarks(LandmarkSet::default()),
            Detection::new("person", full, 0.5),
            person(full, (f32::NAN, 0.5)),
        ];

        reducer.on_frame(FrameInput::new(&detections, &info));

        let got = reducer.sink().last().expect("published");
        assert!(close(got.x, 0.3));
        assert_eq!(
            reducer.stats(),
            ReducerStats {
                frames: 1,
                persons: 4,
                published: 1,
                skipped: 3,
            }
        );
    }

    #[test]
    fn missing_caps_skip_extraction_but_count_the_frame() {
        let mut reducer = FrameReducer::new(RecordingSink::default());
        let detections = [person(BoundingBox::new(0.0, 0.0, 1.0, 1.0), (0.5, 0.5))];
        let frame = FrameInput {
            detections: &detections,
            pixels: None,
            info: None,
        };
        assert_eq!(reducer.on_frame(frame), Ack::Pass);
        assert_eq!(reducer.sink().count(), 0);
        assert_eq!(reducer.frame_count(), 1);
    }

    #[test]
    fn pixel_access_is_opt_in() {
        let info = info();
        let reducer = FrameReducer::new(RecordingSink::default());
        assert!(!reducer.wants_pixels());

        let mut reducer = reducer.with_frame_access(true);
        assert!(reducer.wants_pixels());
        let pixels = vec![0u8; 12];
        let detections = [person(BoundingBox::new(0.0, 0.0, 1.0, 1.0), (0.5, 0.5))];
        reducer.on_frame(FrameInput::new(&detections, &info).with_pixels(&pixels));
        assert_eq!(reducer.sink().count(), 1);
    }

    #[test]
    fn pose_sample_reports_eyes_in_frame_space() -> Result<(), DetectionSkip> {
        let bbox = BoundingBox::new(0.2, 0.2, 0.5, 0.5);
        let pose = PoseSample::extract(
            &bbox,
            &LandmarkSet::from_points([(0.5, 0.5), (0.4, 0.2), (0.6, 0.2)]),
        )?;
        assert!(close(pose.nose.0, 0.45));
        let (lx, ly) = pose.left_eye;
        assert!(close(lx, 0.4));
        assert!(close(ly, 0.3));
        let (rx, ry) = pose.right_eye;
        assert!(close(rx, 0.5));
        assert!(close(ry, 0.3));

        assert_eq!(
            PoseSample::extract(&bbox, &LandmarkSet::default()),
            Err(DetectionSkip::NoLandmarks)
        );
        assert_eq!(
            PoseSample::extract(&bbox, &LandmarkSet::from_points([(0.5, 0.5)])),
            Err(DetectionSkip::MissingKeypoint(Keypoint::LeftEye))
        );
        assert_eq!(
            PoseSample::extract(&bbox, &LandmarkSet::from_points([(0.5, 0.5), (0.4, 0.2)])),
            Err(DetectionSkip::MissingKeypoint(Keypoint::RightEye))
        );
        Ok(())
    }

    #[test]
    fn short_landmark_sets_publish_nothing() {
        let info = info();
        let mut reducer = FrameReducer::new(RecordingSink::default());
        let full = BoundingBox::new(0.0, 0.0, 1.0, 1.0);

        let short = [
            Detection::new("person", full, 0.9)
                .with_landmarks(LandmarkSet::from_points([(0.5, 0.5)])),
            Detection::new("person", full, 0.9)
                .with_landmarks(LandmarkSet::from_points([(0.5, 0.5), (0.4, 0.1)])),
        ];
        reducer.on_frame(FrameInput::new(&short, &info));
        assert_eq!(reducer.sink().count(), 0);
        assert_eq!(reducer.stats().skipped, 2);

        let mixed = [short[0].clone(), short[1].clone(), person(full, (0.7, 0.5))];
        reducer.on_frame(FrameInput::new(&mixed, &info));
        assert_eq!(reducer.sink().count(), 1);
        let got = reducer.sink().last().expect("published");
        assert!(close(got.x, 0.7));
        assert!(close(got.y, 0.5));
    }

    #[cfg(unix)]
    #[test]
    fn reducer_publishes_into_shared_state() -> Result<(), SharedStateError> {
        use crate::shared::SharedState;

        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("gaze");
        let mut reducer = FrameReducer::new(SharedState::create(&path)?);
        let consumer = SharedState::open(&path)?;

        let info = info();
        let detections = [person(BoundingBox::new(0.2, 0.1, 0.4, 0.5), (0.5, 0.6))];
        reducer.on_frame(FrameInput::new(&detections, &info));

        let target = consumer.read_target()?;
        assert!(close(target.x, 0.4));
        assert!(close(target.y, 0.75));
        Ok(())
    }
}
