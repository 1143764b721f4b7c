use crate::context::{MediaContext, MediaContextOptions};
use crate::input::BaseTrackInput;
use crate::output::StandaloneTrackOutput;
use crate::track::{MediaStreamTrack, TrackInput};
use mediamux_dummy::DummyBackend;
use mediamux_traits::{GraphBackend, MediaError, MediaKind, StageKind, VideoPattern};
use std::rc::Rc;
use std::sync::Arc;

pub(crate) fn setup() -> (Arc<DummyBackend>, Rc<MediaContext>) {
    let backend = Arc::new(DummyBackend::new());
    let context = MediaContext::new(
        backend.clone() as Arc<dyn GraphBackend>,
        MediaContextOptions::default(),
    )
    .unwrap();
    (backend, context)
}

fn video_input(context: &Rc<MediaContext>) -> Rc<BaseTrackInput> {
    BaseTrackInput::test_video(context, VideoPattern::Smpte).unwrap()
}

#[test]
fn test_clone_scenario() {
    let (_backend, context) = setup();
    let producer = video_input(&context);
    let t1 = MediaStreamTrack::new(&context, producer.clone()).unwrap();
    let t2 = t1.clone_track().unwrap();
    assert_eq!(producer.branch_count(), 2);

    let c1 = StandaloneTrackOutput::new(&context, MediaKind::Video);
    c1.set_track(Some(&t1)).unwrap();
    assert_eq!(t1.branch_count(), 1);
    assert_eq!(t1.output_count(), 1);
    assert!(producer.is_running());

    c1.set_track(None).unwrap();
    assert_eq!(t1.branch_count(), 0);
    assert!(!producer.is_running());

    let c2 = StandaloneTrackOutput::new(&context, MediaKind::Video);
    c2.set_track(Some(&t2)).unwrap();
    assert_eq!(t2.branch_count(), 1);
    assert_eq!(t1.branch_count(), 0);
    assert!(producer.is_running());
    c2.set_track(None).unwrap();
    assert_eq!(t1.branch_count(), 0);
    assert_eq!(t2.branch_count(), 0);
    assert_eq!(producer.usage_count(), 0);
}

#[test]
fn test_producer_runs_while_any_output_remains() {
    let (_backend, context) = setup();
    let producer = video_input(&context);
    let track = MediaStreamTrack::new(&context, producer.clone()).unwrap();

    let outputs: Vec<_> = (0..5).map(|_| track.add_output().unwrap()).collect();
    for (removed, output) in outputs.iter().enumerate() {
        assert!(producer.is_running());
        track.remove_output(*output).unwrap();
        assert_eq!(producer.is_running(), outputs.len() - removed - 1 > 0);
    }
    assert_eq!(producer.usage_count(), 0);
}

#[test]
fn test_clones_share_the_producer() {
    let (_backend, context) = setup();
    let producer = video_input(&context);
    let original = MediaStreamTrack::new(&context, producer.clone()).unwrap();
    let clone = original.clone_track().unwrap();

    let a = original.add_output().unwrap();
    let b = clone.add_output().unwrap();
    assert_eq!(producer.usage_count(), 2);

    clone.remove_output(b).unwrap();
    assert!(producer.is_running());
    assert_eq!(original.branch_count(), 1);
    assert_eq!(clone.branch_count(), 0);

    original.remove_output(a).unwrap();
    assert!(!producer.is_running());
}

#[test]
fn test_every_consumer_gets_each_buffer_once() {
    let (backend, context) = setup();
    let producer = video_input(&context);
    let track = MediaStreamTrack::new(&context, producer.clone()).unwrap();
    let clone = track.clone_track().unwrap();

    let consumers: Vec<_> = (0..3)
        .map(|i| {
            let consumer = StandaloneTrackOutput::new(&context, MediaKind::Video);
            let source = if i == 0 { &clone } else { &track };
            consumer.set_track(Some(source)).unwrap();
            consumer
        })
        .collect();

    assert_eq!(backend.push_buffer(producer.source_stage()), 3);
    for consumer in &consumers {
        assert_eq!(backend.rendered(consumer.render_stage().unwrap()), 1);
    }

    consumers[1].set_track(None).unwrap();
    assert_eq!(backend.push_buffer(producer.source_stage()), 2);
    assert_eq!(backend.rendered(consumers[1].render_stage().unwrap()), 1);
}

#[test]
fn test_unavailable_render_leaves_track_untouched() {
    let (backend, context) = setup();
    let producer = video_input(&context);
    let track = MediaStreamTrack::new(&context, producer.clone()).unwrap();

    backend.fail_stage_creation(&StageKind::Render(MediaKind::Video));
    let consumer = StandaloneTrackOutput::new(&context, MediaKind::Video);
    assert!(matches!(
        consumer.set_track(Some(&track)),
        Err(MediaError::Unavailable(_))
    ));
    assert_eq!(consumer.sink_graph(), None);
    assert_eq!(track.output_count(), 0);
    assert!(!producer.is_running());
    assert_eq!(producer.kind(), MediaKind::Video);
}
