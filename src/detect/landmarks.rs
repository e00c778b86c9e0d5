use serde::Deserialize;

/// COCO pose keypoints in model output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keypoint {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl Keypoint {
    pub const ALL: [Keypoint; 17] = [
        Keypoint::Nose,
        Keypoint::LeftEye,
        Keypoint::RightEye,
        Keypoint::LeftEar,
        Keypoint::RightEar,
        Keypoint::LeftShoulder,
        Keypoint::RightShoulder,
        Keypoint::LeftElbow,
        Keypoint::RightElbow,
        Keypoint::LeftWrist,
        Keypoint::RightWrist,
        Keypoint::LeftHip,
        Keypoint::RightHip,
        Keypoint::LeftKnee,
        Keypoint::RightKnee,
        Keypoint::LeftAnkle,
        Keypoint::RightAnkle,
    ];

    /// Position of this keypoint in a landmark set.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Keypoint::Nose => "nose",
            Keypoint::LeftEye => "left_eye",
            Keypoint::RightEye => "right_eye",
            Keypoint::LeftEar => "left_ear",
            Keypoint::RightEar => "right_ear",
            Keypoint::LeftShoulder => "left_shoulder",
            Keypoint::RightShoulder => "right_shoulder",
            Keypoint::LeftElbow => "left_elbow",
            Keypoint::RightElbow => "right_elbow",
            Keypoint::LeftWrist => "left_wrist",
            Keypoint::RightWrist => "right_wrist",
            Keypoint::LeftHip => "left_hip",
            Keypoint::RightHip => "right_hip",
            Keypoint::LeftKnee => "left_knee",
            Keypoint::RightKnee => "right_knee",
            Keypoint::LeftAnkle => "left_ankle",
            Keypoint::RightAnkle => "right_ankle",
        }
    }
}

/// A single keypoint, normalised to the owning detection's bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Landmark {
    pub index: usize,
    pub x: f32,
    pub y: f32,
}

/// Ordered landmark points of one pose.
///
/// Serialized as an array of `[x, y]` pairs; indices follow array order.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(from = "Vec<[f32; 2]>")]
pub struct LandmarkSet {
    points: Vec<Landmark>,
}

impl LandmarkSet {
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = (f32, f32)>,
    {
        Self {
            points: points
                .into_iter()
                .enumerate()
                .map(|(index, (x, y))| Landmark { index, x, y })
                .collect(),
        }
    }

    pub fn get(&self, keypoint: Keypoint) -> Option<&Landmark> {
        self.points.get(keypoint.index())
    }

    pub fn points(&self) -> &[Landmark] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl From<Vec<[f32; 2]>> for LandmarkSet {
    fn from(points: Vec<[f32; 2]>) -> Self {
        Self::from_points(points.into_iter().map(|[x, y]| (x, y)))
    }
}
