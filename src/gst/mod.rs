//! GStreamer backend.
//!
//! Turns a validated `Graph` into a live `gstreamer::Pipeline`, attaches a
//! `FrameObserver` to the callback stage as a buffer probe and drives the
//! bus until end of stream, an error, or a stop request.
//!
//! Construction is all-or-nothing: if any element cannot be made, configured
//! or linked, the half-built pipeline is set to `Null` and dropped before the
//! error is returned.

mod roi;

pub use roi::{CustomMetaRoiReader, RoiReader, ROI_META_NAME};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gstreamer as gst;
use gstreamer::prelude::*;

use crate::error::GraphError;
use crate::graph::{Graph, Stage, StageKind};
use crate::reducer::{Ack, FrameInfo, FrameInput, FrameObserver};

/// Interval at which the bus loop checks for a stop request.
const BUS_POLL_MS: u64 = 100;

/// A constructed, not yet running pipeline.
pub struct LivePipeline {
    pipeline: gst::Pipeline,
}

impl LivePipeline {
    /// Instantiate every stage and link them.
    pub fn build(graph: &Graph) -> Result<Self, GraphError> {
        gst::init().map_err(|e| GraphError::Backend(format!("initialize gstreamer: {}", e)))?;

        let pipeline = gst::Pipeline::with_name("eye-catcher");
        if let Err(e) = populate(&pipeline, graph) {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(e);
        }
        log::info!(
            "pipeline constructed: {} stages, {} links",
            graph.stages().len(),
            graph.links().len()
        );
        Ok(Self { pipeline })
    }

    /// Install `observer` on the src pad of `stage`.
    ///
    /// Returns a handle to the observer so the caller can inspect it after
    /// the pipeline stops.
    pub fn attach_observer<O, R>(
        &self,
        stage: &str,
        observer: O,
        reader: R,
    ) -> Result<Arc<Mutex<O>>, GraphError>
    where
        O: FrameObserver + 'static,
        R: RoiReader,
    {
        let element = self
            .pipeline
            .by_name(stage)
            .ok_or_else(|| GraphError::UnknownStage(stage.to_string()))?;
        let pad = element
            .static_pad("src")
            .ok_or_else(|| GraphError::Backend(format!("{} has no src pad", stage)))?;

        let observer = Arc::new(Mutex::new(observer));
        let handle = Arc::clone(&observer);
        pad.add_probe(gst::PadProbeType::BUFFER, move |pad, info| {
            let Some(buffer) = info.buffer() else {
                return gst::PadProbeReturn::Ok;
            };
            let mut observer = match handle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let frame_info = pad.current_caps().and_then(|caps| frame_info(&caps));
            let detections = match frame_info {
                Some(_) => reader.read(buffer),
                None => Vec::new(),
            };
            let map = match (&frame_info, observer.wants_pixels()) {
                (Some(_), true) => buffer.map_readable().ok(),
                _ => None,
            };

            let input = FrameInput {
                detections: &detections,
                pixels: map.as_ref().map(|m| m.as_slice()),
                info: frame_info.as_ref(),
            };
            match observer.on_frame(input) {
                Ack::Pass => gst::PadProbeReturn::Ok,
            }
        })
        .ok_or_else(|| GraphError::Backend(format!("failed to add probe on {}", stage)))?;

        log::info!("frame observer attached to {}", stage);
        Ok(observer)
    }

    /// Log the display sink's fps measurements.
    pub fn log_fps(&self, sink: &str) -> Result<(), GraphError> {
        let element = self
            .pipeline
            .by_name(sink)
            .ok_or_else(|| GraphError::UnknownStage(sink.to_string()))?;
        element.connect("fps-measurements", false, |values| {
            let value = |i: usize| values.get(i).and_then(|v| v.get::<f64>().ok());
            if let (Some(fps), Some(droprate), Some(avg)) = (value(1), value(2), value(3)) {
                log::info!(
                    "fps {:.1} (drop rate {:.1}, average {:.1})",
                    fps,
                    droprate,
                    avg
                );
            }
            None
        });
        Ok(())
    }

    /// Run until end of stream, a pipeline error, or `stop` is raised.
    ///
    /// With `loop_file` set, end of stream seeks back to the start instead.
    /// The pipeline is always left in `Null`.
    pub fn run(&self, stop: &AtomicBool, loop_file: bool) -> Result<(), GraphError> {
        let result = self.run_inner(stop, loop_file);
        let _ = self.pipeline.set_state(gst::State::Null);
        result
    }

    fn run_inner(&self, stop: &AtomicBool, loop_file: bool) -> Result<(), GraphError> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| GraphError::Backend("pipeline has no bus".to_string()))?;
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| GraphError::Backend(format!("set pipeline to Playing: {}", e)))?;
        log::info!("pipeline playing");

        loop {
            if stop.load(Ordering::SeqCst) {
                log::info!("stop requested");
                return Ok(());
            }
            let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL_MS)) else {
                continue;
            };

            use gst::MessageView;
            match message.view() {
                MessageView::Eos(..) if loop_file => {
                    log::info!("end of stream, rewinding");
                    self.pipeline
                        .seek_simple(
                            gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                            gst::ClockTime::ZERO,
                        )
                        .map_err(|e| GraphError::Backend(format!("rewind: {}", e)))?;
                }
                MessageView::Eos(..) => {
                    log::info!("end of stream");
                    return Ok(());
                }
                MessageView::Error(err) => {
                    return Err(GraphError::Backend(format!(
                        "gstreamer error from {:?}: {} ({:?})",
                        err.src().map(|s| s.path_string()),
                        err.error(),
                        err.debug()
                    )));
                }
                MessageView::Warning(warning) => {
                    log::warn!(
                        "gstreamer warning from {:?}: {}",
                        warning.src().map(|s| s.path_string()),
                        warning.error()
                    );
                }
                MessageView::StateChanged(change)
                    if change.src() == Some(self.pipeline.upcast_ref::<gst::Object>()) =>
                {
                    log::debug!(
                        "pipeline state {:?} -> {:?}",
                        change.old(),
                        change.current()
                    );
                }
                _ => {}
            }
        }
    }
}

impl Drop for LivePipeline {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn frame_info(caps: &gst::CapsRef) -> Option<FrameInfo> {
    let info = gstreamer_video::VideoInfo::from_caps(caps).ok()?;
    Some(FrameInfo {
        format: info.format().to_str().to_string(),
        width: info.width(),
        height: info.height(),
    })
}

fn populate(pipeline: &gst::Pipeline, graph: &Graph) -> Result<(), GraphError> {
    let mut elements: HashMap<&str, gst::Element> = HashMap::new();
    for stage in graph.stages() {
        let element = make_element(stage)?;
        pipeline
            .add(&element)
            .map_err(|e| GraphError::Backend(format!("add {}: {}", stage.name, e)))?;
        elements.insert(stage.name.as_str(), element);
    }

    for link in graph.links() {
        let lookup = |name: &str| {
            elements
                .get(name)
                .ok_or_else(|| GraphError::UnknownStage(name.to_string()))
        };
        let src = lookup(&link.from)?;
        let dst = lookup(&link.to)?;

        if link.from_pad.is_none() && has_sometimes_src(src) {
            defer_link(src, dst, link.to_pad.as_deref());
            continue;
        }
        src.link_pads(link.from_pad.as_deref(), dst, link.to_pad.as_deref())
            .map_err(|e| GraphError::Link {
                from: link.from.clone(),
                to: link.to.clone(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

fn make_element(stage: &Stage) -> Result<gst::Element, GraphError> {
    let factory = stage.spec.factory();
    let element = gst::ElementFactory::make(factory)
        .name(stage.name.as_str())
        .build()
        .map_err(|_| GraphError::MissingElement {
            factory: factory.to_string(),
            stage: stage.name.clone(),
        })?;

    match stage.spec.kind() {
        StageKind::Caps { .. } => {
            let raw = stage.spec.caps_string().unwrap_or_default();
            let caps = raw
                .parse::<gst::Caps>()
                .map_err(|_| GraphError::InvalidCaps {
                    stage: stage.name.clone(),
                    caps: raw.clone(),
                })?;
            element.set_property("caps", &caps);
        }
        StageKind::Element { properties, .. } => {
            for (key, value) in properties {
                let pspec = element
                    .find_property(key)
                    .ok_or_else(|| GraphError::UnknownProperty {
                        stage: stage.name.clone(),
                        property: key.clone(),
                    })?;
                let raw = value.to_string();
                let invalid = || GraphError::InvalidProperty {
                    stage: stage.name.clone(),
                    property: key.clone(),
                    value: raw.clone(),
                };

                // Element-valued properties (e.g. `video-sink`) name a factory.
                if pspec.value_type().is_a(gst::Element::static_type()) {
                    let child = gst::ElementFactory::make(&raw).build().map_err(|_| {
                        GraphError::MissingElement {
                            factory: raw.clone(),
                            stage: stage.name.clone(),
                        }
                    })?;
                    element.set_property(key, &child);
                } else {
                    let parsed = glib_value(&raw, pspec.value_type()).ok_or_else(invalid)?;
                    element.set_property_from_value(key, &parsed);
                }
            }
        }
    }
    Ok(element)
}

fn glib_value(raw: &str, ty: gst::glib::Type) -> Option<gst::glib::Value> {
    gst::glib::Value::deserialize(raw, ty).ok()
}

fn has_sometimes_src(element: &gst::Element) -> bool {
    element.pad_template_list().iter().any(|template| {
        template.direction() == gst::PadDirection::Src
            && template.presence() == gst::PadPresence::Sometimes
    })
}

/// Link the first compatible pad `src` exposes once it appears (demuxers).
fn defer_link(src: &gst::Element, dst: &gst::Element, to_pad: Option<&str>) {
    let dst_weak = dst.downgrade();
    let to_pad = to_pad.map(str::to_string);
    src.connect_pad_added(move |src, pad| {
        let Some(dst) = dst_weak.upgrade() else {
            return;
        };
        let sink = match &to_pad {
            Some(name) => dst.request_pad_simple(name).or_else(|| dst.static_pad(name)),
            None => dst.static_pad("sink"),
        };
        let Some(sink) = sink else {
            log::warn!("{} has no sink pad for {}", dst.name(), src.name());
            return;
        };
        if sink.is_linked() {
            return;
        }
        match pad.link(&sink) {
            Ok(_) => log::debug!("linked {}:{} -> {}", src.name(), pad.name(), dst.name()),
            Err(e) => log::debug!(
                "skipping {}:{} for {}: {:?}",
                src.name(),
                pad.name(),
                dst.name(),
                e
            ),
        }
    });
}
