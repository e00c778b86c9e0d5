use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::pipeline::{DisplayParams, ModelParams, PipelineConfig};
use crate::reducer::GazeMapping;
use crate::source::{NetworkInput, PixelFormat, SourceKind, SourceSettings};

const DEFAULT_SHARED_PATH: &str = "/dev/shm/eye-catcher";
const DEFAULT_USB_DEVICE: &str = "/dev/video0";
const DEFAULT_RESOURCES_DIR: &str = "resources";
const DEFAULT_POSTPROCESS_DIR: &str = "postprocess";
const DEFAULT_HEF_NAME: &str = "yolov8s_pose_h8l_pi.hef";
const DEFAULT_POSTPROCESS_NAME: &str = "libyolov8pose_post.so";

const ENV_VARS: &[&str] = &[
    "EYE_CATCHER_CONFIG",
    "EYE_CATCHER_SOURCE",
    "EYE_CATCHER_INPUT",
    "EYE_CATCHER_HEF_PATH",
    "EYE_CATCHER_POSTPROCESS_SO",
    "EYE_CATCHER_VIDEO_SINK",
    "EYE_CATCHER_SHARED_PATH",
    "EYE_CATCHER_SHOW_FPS",
    "EYE_CATCHER_USE_FRAME",
    "EYE_CATCHER_SYNC",
    "EYE_CATCHER_LOOP_FILE",
];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EyeCatcherConfigFile {
    source: Option<SourceConfigFile>,
    network: Option<NetworkConfigFile>,
    model: Option<ModelConfigFile>,
    display: Option<DisplayConfigFile>,
    callback: Option<CallbackConfigFile>,
    shared: Option<SharedConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    kind: Option<String>,
    input: Option<String>,
    loop_file: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct NetworkConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelConfigFile {
    hef_path: Option<PathBuf>,
    batch_size: Option<u32>,
    postprocess_so: Option<PathBuf>,
    function_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DisplayConfigFile {
    video_sink: Option<String>,
    sync: Option<bool>,
    show_fps: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CallbackConfigFile {
    use_frame: Option<bool>,
    band_top: Option<f32>,
    band_bottom: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SharedConfigFile {
    path: Option<PathBuf>,
}

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct EyeCatcherConfig {
    pub pipeline: PipelineConfig,
    /// Map pixel data for the frame observer.
    pub use_frame: bool,
    /// Restart file sources at end of stream.
    pub loop_file: bool,
    pub gaze: GazeMapping,
    /// Backing file of the shared state.
    pub shared_path: PathBuf,
}

/// Source selection before the kind is resolved.
///
/// The kind stays a string until `build` so an unknown name is reported
/// as a configuration error rather than lost while merging layers.
#[derive(Debug, Clone, Default)]
struct PendingSource {
    kind: Option<String>,
    input: String,
}

impl EyeCatcherConfig {
    /// Load from `EYE_CATCHER_CONFIG` (if set), then apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("EYE_CATCHER_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, reading `path` instead of `EYE_CATCHER_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::builder(path)?.build()
    }

    /// Layered loader: file, then environment. Callers may adjust the
    /// builder (CLI flags) before `build` validates.
    pub fn builder(path: Option<&Path>) -> Result<ConfigBuilder, ConfigError> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => EyeCatcherConfigFile::default(),
        };
        let mut builder = ConfigBuilder::from_file(file_cfg);
        builder.apply_env()?;
        Ok(builder)
    }

    /// Names of every environment variable the loader reads.
    pub fn env_vars() -> &'static [&'static str] {
        ENV_VARS
    }
}

/// Partially resolved configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    source: PendingSource,
    network_format: String,
    network: NetworkInput,
    model: ModelParams,
    display: DisplayParams,
    use_frame: bool,
    loop_file: bool,
    gaze: GazeMapping,
    shared_path: PathBuf,
}

impl ConfigBuilder {
    fn from_file(file: EyeCatcherConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let network = file.network.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let display = file.display.unwrap_or_default();
        let callback = file.callback.unwrap_or_default();
        let defaults = NetworkInput::default();
        let display_defaults = DisplayParams::default();
        let gaze_defaults = GazeMapping::default();

        Self {
            source: PendingSource {
                kind: source.kind,
                input: source.input.unwrap_or_default(),
            },
            network_format: network
                .format
                .unwrap_or_else(|| defaults.format.as_str().to_string()),
            network: NetworkInput {
                width: network.width.unwrap_or(defaults.width),
                height: network.height.unwrap_or(defaults.height),
                format: defaults.format,
            },
            model: ModelParams {
                hef_path: model
                    .hef_path
                    .unwrap_or_else(|| Path::new(DEFAULT_RESOURCES_DIR).join(DEFAULT_HEF_NAME)),
                batch_size: model.batch_size.unwrap_or(2),
                postprocess_so: model.postprocess_so.unwrap_or_else(|| {
                    Path::new(DEFAULT_POSTPROCESS_DIR).join(DEFAULT_POSTPROCESS_NAME)
                }),
                function_name: model.function_name.unwrap_or_else(|| "filter".to_string()),
            },
            display: DisplayParams {
                video_sink: display.video_sink.unwrap_or(display_defaults.video_sink),
                sync: display.sync.unwrap_or(display_defaults.sync),
                show_fps: display.show_fps.unwrap_or(display_defaults.show_fps),
            },
            use_frame: callback.use_frame.unwrap_or(false),
            loop_file: source.loop_file.unwrap_or(false),
            gaze: GazeMapping {
                band_top: callback.band_top.unwrap_or(gaze_defaults.band_top),
                band_bottom: callback.band_bottom.unwrap_or(gaze_defaults.band_bottom),
            },
            shared_path: file
                .shared
                .and_then(|shared| shared.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SHARED_PATH)),
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(kind) = env_string("EYE_CATCHER_SOURCE") {
            self.source.kind = Some(kind);
        }
        if let Some(input) = env_string("EYE_CATCHER_INPUT") {
            self.source.input = input;
        }
        if let Some(path) = env_string("EYE_CATCHER_HEF_PATH") {
            self.model.hef_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("EYE_CATCHER_POSTPROCESS_SO") {
            self.model.postprocess_so = PathBuf::from(path);
        }
        if let Some(sink) = env_string("EYE_CATCHER_VIDEO_SINK") {
            self.display.video_sink = sink;
        }
        if let Some(path) = env_string("EYE_CATCHER_SHARED_PATH") {
            self.shared_path = PathBuf::from(path);
        }
        if let Some(v) = env_bool("EYE_CATCHER_SHOW_FPS")? {
            self.display.show_fps = v;
        }
        if let Some(v) = env_bool("EYE_CATCHER_USE_FRAME")? {
            self.use_frame = v;
        }
        if let Some(v) = env_bool("EYE_CATCHER_SYNC")? {
            self.display.sync = v;
        }
        if let Some(v) = env_bool("EYE_CATCHER_LOOP_FILE")? {
            self.loop_file = v;
        }
        Ok(())
    }

    pub fn source_kind(&mut self, kind: &str) -> &mut Self {
        self.source.kind = Some(kind.to_string());
        self
    }

    pub fn input(&mut self, input: &str) -> &mut Self {
        self.source.input = input.to_string();
        self
    }

    pub fn show_fps(&mut self, show: bool) -> &mut Self {
        self.display.show_fps = show;
        self
    }

    pub fn use_frame(&mut self, use_frame: bool) -> &mut Self {
        self.use_frame = use_frame;
        self
    }

    pub fn sync(&mut self, sync: bool) -> &mut Self {
        self.display.sync = sync;
        self
    }

    pub fn loop_file(&mut self, loop_file: bool) -> &mut Self {
        self.loop_file = loop_file;
        self
    }

    /// Resolve and validate. Nothing is described or constructed on error.
    pub fn build(&self) -> Result<EyeCatcherConfig, ConfigError> {
        let kind = match self.source.kind.as_deref() {
            Some(kind) => kind.parse::<SourceKind>()?,
            None => SourceKind::infer(&self.source.input),
        };
        let input = match self.source.input.trim() {
            "" if kind == SourceKind::Usb => DEFAULT_USB_DEVICE,
            input => input,
        };
        let source = SourceSettings::new(kind, input);
        source.validate()?;

        let network = NetworkInput {
            format: self.network_format.parse::<PixelFormat>()?,
            ..self.network
        };
        network.validate()?;
        self.model.validate()?;

        if self.display.video_sink.trim().is_empty() {
            return Err(ConfigError::Empty("video sink"));
        }
        if !(self.gaze.band_bottom > self.gaze.band_top) {
            return Err(ConfigError::Band {
                top: self.gaze.band_top,
                bottom: self.gaze.band_bottom,
            });
        }
        if self.shared_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty("shared state path"));
        }

        Ok(EyeCatcherConfig {
            pipeline: PipelineConfig {
                source,
                network,
                model: self.model.clone(),
                display: self.display.clone(),
            },
            use_frame: self.use_frame,
            loop_file: self.loop_file && kind == SourceKind::File,
            gaze: self.gaze,
            shared_path: self.shared_path.clone(),
        })
    }
}

fn read_config_file(path: &Path) -> Result<EyeCatcherConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |reason: String| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    };
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        toml::from_str(&raw).map_err(|e| parse_error(e.to_string()))
    } else {
        serde_json::from_str(&raw).map_err(|e| parse_error(e.to_string()))
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = env_string(var) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Env { var, value }),
    }
}
