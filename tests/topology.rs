use eye_catcher::graph::StageKind;
use eye_catcher::pipeline::{MUXER_STAGE, TEE_STAGE};
use eye_catcher::source::SourceKind;
use eye_catcher::{
    build_topology, Error, PipelineConfig, SourceSettings, CALLBACK_STAGE, DISPLAY_STAGE,
};

fn config(kind: SourceKind, input: &str) -> PipelineConfig {
    PipelineConfig::new(SourceSettings::new(kind, input))
}

#[test]
fn every_source_reaches_the_display_through_the_callback() {
    for (kind, input) in [
        (SourceKind::Camera, ""),
        (SourceKind::Usb, "/dev/video0"),
        (SourceKind::File, "/srv/clips/lobby.mp4"),
    ] {
        let graph = build_topology(&config(kind, input)).expect("topology");

        let head = graph.walk_from("src_0");
        assert_eq!(head.last(), Some(&TEE_STAGE), "{} source", kind);

        let tail = graph.walk_from(MUXER_STAGE);
        let callback = tail
            .iter()
            .position(|s| *s == CALLBACK_STAGE)
            .expect("callback after the muxer");
        assert_eq!(tail.last(), Some(&DISPLAY_STAGE));
        assert!(callback < tail.len() - 1);
        assert_eq!(graph.downstream(DISPLAY_STAGE).count(), 0);
    }
}

#[test]
fn queues_bound_every_spine_boundary() {
    let graph = build_topology(&config(SourceKind::Camera, "")).expect("topology");
    for stage in graph.stages() {
        let StageKind::Element { factory, .. } = stage.spec.kind() else {
            continue;
        };
        if factory != "queue" {
            continue;
        }
        assert_eq!(
            stage.spec.get("leaky").map(|v| v.to_string()).as_deref(),
            Some("no"),
            "{} is leaky",
            stage.name
        );
        let depth = stage
            .spec
            .get("max-size-buffers")
            .map(|v| v.to_string())
            .expect("depth");
        let expected = if stage.name == "bypass_queue" { "20" } else { "3" };
        assert_eq!(depth, expected, "{}", stage.name);
    }
}

#[test]
fn launch_string_names_the_branch_points() {
    let graph = build_topology(&config(SourceKind::File, "/srv/clips/lobby.mp4"))
        .expect("topology");
    let launch = graph.to_launch_string();

    assert!(launch.starts_with("hailomuxer name=hmux"), "{}", launch);
    assert!(launch.contains("filesrc name=src_0 location=/srv/clips/lobby.mp4"));
    assert!(launch.contains("tee name=t"));
    assert!(launch.contains("! hmux.sink_0"));
    assert!(launch.contains("! hmux.sink_1"));
    assert!(launch.contains("identity name=identity_callback"));
    assert!(launch.contains("fpsdisplaysink name=hailo_display"));
}

#[test]
fn bad_configuration_fails_before_description() {
    let mut cfg = config(SourceKind::Usb, "");
    assert!(matches!(build_topology(&cfg), Err(Error::Config(_))));

    cfg.source.input = "/dev/video0".to_string();
    cfg.model.batch_size = 0;
    assert!(matches!(build_topology(&cfg), Err(Error::Config(_))));
}

#[cfg(unix)]
mod shared_state {
    use eye_catcher::detect::{BoundingBox, Detection, LandmarkSet};
    use eye_catcher::reducer::FrameInfo;
    use eye_catcher::{FrameInput, FrameObserver, FrameReducer, SharedState};
    use tempfile::TempDir;

    fn person(nose: (f32, f32)) -> Detection {
        let mut points = vec![(0.0f32, 0.0f32); 17];
        points[0] = nose;
        points[1] = (nose.0 - 0.05, nose.1 - 0.05);
        points[2] = (nose.0 + 0.05, nose.1 - 0.05);
        Detection::new("person", BoundingBox::new(0.0, 0.0, 1.0, 1.0), 0.9)
            .with_landmarks(LandmarkSet::from_points(points))
    }

    #[test]
    fn reducer_publishes_to_a_second_mapping() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("gaze");
        let producer = SharedState::create(&path).expect("create");
        let consumer = SharedState::open(&path).expect("open");

        let mut reducer = FrameReducer::new(producer);
        let info = FrameInfo {
            format: "RGB".to_string(),
            width: 640,
            height: 640,
        };
        let frame = [person((0.25, 0.5))];
        reducer.on_frame(FrameInput::new(&frame, &info));

        let snapshot = consumer.snapshot().expect("snapshot");
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.target.x, 0.25);
        assert!((snapshot.target.y - 0.5).abs() < 1e-5);
        assert_eq!(reducer.stats().published, 1);
    }
}
