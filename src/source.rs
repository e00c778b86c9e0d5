//! Capture source selection.
//!
//! Each source kind yields a linear graph fragment. Whatever the capture
//! device delivers, every fragment ends in the same shared tail (scale,
//! convert, caps) so its output matches the network input exactly: width,
//! height, pixel format and square pixels.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::graph::{PropValue, StageSpec};

/// Native capture size of the camera module before rescaling.
pub const CAMERA_NATIVE_WIDTH: u32 = 1536;
pub const CAMERA_NATIVE_HEIGHT: u32 = 864;

/// Fixed capture size requested from USB devices.
pub const USB_CAPTURE_WIDTH: u32 = 640;
pub const USB_CAPTURE_HEIGHT: u32 = 480;

pub const CAPTURE_FRAMERATE: PropValue = PropValue::Fraction(30, 1);

/// Default depth of the queues separating stages.
pub const QUEUE_DEPTH: u32 = 3;

/// Capture modality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Board camera module (libcamera).
    Camera,
    /// USB capture device (V4L2).
    Usb,
    /// Encoded video file on disk.
    File,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Camera => "camera",
            SourceKind::Usb => "usb",
            SourceKind::File => "file",
        }
    }

    /// Guess the kind from the input path when none is configured.
    pub fn infer(input: &str) -> SourceKind {
        let input = input.trim();
        if input.is_empty() {
            SourceKind::Camera
        } else if input.starts_with("/dev/video") {
            SourceKind::Usb
        } else {
            SourceKind::File
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" | "rpi" => Ok(SourceKind::Camera),
            "usb" => Ok(SourceKind::Usb),
            "file" => Ok(SourceKind::File),
            _ => Err(ConfigError::UnknownSourceKind(s.to_string())),
        }
    }
}

/// Raw pixel formats the inference input may require.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Bgr,
    Nv12,
    I420,
    Yuy2,
}

impl PixelFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::I420 => "I420",
            PixelFormat::Yuy2 => "YUY2",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RGB" => Ok(PixelFormat::Rgb),
            "BGR" => Ok(PixelFormat::Bgr),
            "NV12" => Ok(PixelFormat::Nv12),
            "I420" => Ok(PixelFormat::I420),
            "YUY2" => Ok(PixelFormat::Yuy2),
            _ => Err(ConfigError::UnknownPixelFormat(s.to_string())),
        }
    }
}

/// Frame geometry and format the inference stage consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkInput {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Default for NetworkInput {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
            format: PixelFormat::Rgb,
        }
    }
}

impl NetworkInput {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 {
            return Err(ConfigError::Zero {
                field: "network width",
            });
        }
        if self.height == 0 {
            return Err(ConfigError::Zero {
                field: "network height",
            });
        }
        Ok(())
    }

    /// Caps every source fragment terminates in.
    pub fn caps(&self) -> StageSpec {
        StageSpec::caps("video/x-raw")
            .prop("format", self.format.as_str())
            .prop("width", self.width)
            .prop("height", self.height)
            .prop("pixel-aspect-ratio", PropValue::Fraction(1, 1))
    }
}

/// Which source to open and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    /// Device node for USB sources, file path for file sources; unused for
    /// the camera module.
    pub input: String,
}

impl SourceSettings {
    pub fn new(kind: SourceKind, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
        }
    }

    /// Parse a kind name; an unknown name fails before any stage exists.
    pub fn parse(kind: &str, input: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self::new(kind.parse()?, input))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            SourceKind::Camera => Ok(()),
            SourceKind::Usb | SourceKind::File if self.input.trim().is_empty() => {
                Err(ConfigError::MissingInput {
                    kind: self.kind.as_str(),
                })
            }
            SourceKind::Usb | SourceKind::File => Ok(()),
        }
    }
}

/// Linear run of stages produced by the source selector.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    pub kind: SourceKind,
    pub stages: Vec<StageSpec>,
}

impl Fragment {
    /// The caps stage the fragment terminates in.
    pub fn tail_caps(&self) -> Option<&StageSpec> {
        self.stages.last().filter(|s| s.caps_string().is_some())
    }
}

/// Bounded queue between stages.
pub fn queue(name: &str, max_size_buffers: u32) -> StageSpec {
    StageSpec::element("queue")
        .named(name)
        .prop("leaky", "no")
        .prop("max-size-buffers", max_size_buffers)
        .prop("max-size-bytes", 0u32)
        .prop("max-size-time", 0u32)
}

/// Build the source fragment for `settings`, ending in `network` caps.
pub fn source_fragment(
    settings: &SourceSettings,
    network: &NetworkInput,
) -> Result<Fragment, ConfigError> {
    settings.validate()?;
    network.validate()?;

    let format = network.format.as_str();
    let mut stages = match settings.kind {
        SourceKind::Camera => vec![
            StageSpec::element("libcamerasrc").named("src_0"),
            StageSpec::caps("video/x-raw")
                .prop("format", format)
                .prop("width", CAMERA_NATIVE_WIDTH)
                .prop("height", CAMERA_NATIVE_HEIGHT),
            queue("queue_src_scale", QUEUE_DEPTH),
            StageSpec::element("videoscale"),
            StageSpec::caps("video/x-raw")
                .prop("format", format)
                .prop("width", network.width)
                .prop("height", network.height)
                .prop("framerate", CAPTURE_FRAMERATE),
            // camera is mounted upside down
            StageSpec::element("videoflip").prop("video-direction", "vert"),
        ],
        SourceKind::Usb => vec![
            StageSpec::element("v4l2src")
                .named("src_0")
                .prop("device", settings.input.as_str()),
            StageSpec::caps("video/x-raw")
                .prop("width", USB_CAPTURE_WIDTH)
                .prop("height", USB_CAPTURE_HEIGHT)
                .prop("framerate", CAPTURE_FRAMERATE),
            StageSpec::element("videoflip").prop("video-direction", "horiz"),
        ],
        SourceKind::File => vec![
            StageSpec::element("filesrc")
                .named("src_0")
                .prop("location", settings.input.as_str()),
            queue("queue_dec264", QUEUE_DEPTH),
            StageSpec::element("qtdemux"),
            StageSpec::element("h264parse"),
            StageSpec::element("avdec_h264").prop("max-threads", 2u32),
            StageSpec::caps("video/x-raw").prop("format", PixelFormat::I420.as_str()),
        ],
    };

    stages.extend([
        queue("queue_scale", QUEUE_DEPTH),
        StageSpec::element("videoscale").prop("n-threads", 2u32),
        queue("queue_src_convert", QUEUE_DEPTH),
        StageSpec::element("videoconvert")
            .named("src_convert")
            .prop("n-threads", 3u32)
            .prop("qos", false),
        network.caps(),
    ]);

    Ok(Fragment {
        kind: settings.kind,
        stages,
    })
}
