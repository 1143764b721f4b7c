extern crate env_logger;
extern crate mediamux;
extern crate mediamux_gstreamer;

use mediamux::streams::{
    BaseTrackInput, MediaContextOptions, MediaStreamTrack, StandaloneTrackOutput,
};
use mediamux::{MediaError, MediaKind, MediaMux, VideoPattern};
use mediamux_gstreamer::GStreamerBackend;
use std::time::{Duration, Instant};

fn run() -> Result<(), MediaError> {
    MediaMux::init::<GStreamerBackend>()?;
    let context = MediaMux::get()?.create_context(MediaContextOptions::default())?;

    let smpte = BaseTrackInput::test_video(&context, VideoPattern::Smpte)?;
    let ball = BaseTrackInput::test_video(&context, VideoPattern::Ball)?;
    let first = MediaStreamTrack::new(&context, smpte)?;
    let second = MediaStreamTrack::new(&context, ball)?;
    let copy = first.clone_track()?;

    let main = StandaloneTrackOutput::new(&context, MediaKind::Video);
    let side = StandaloneTrackOutput::new(&context, MediaKind::Video);
    main.set_track(Some(&first))?;
    side.set_track(Some(&copy))?;

    let start = Instant::now();
    let mut swapped = false;
    while start.elapsed() < Duration::from_secs(10) {
        context.dispatch_timeout(Duration::from_millis(100));
        if !swapped && start.elapsed() > Duration::from_secs(5) {
            log::info!("Switching {} to {}", main.name(), second.label());
            main.set_track(Some(&second))?;
            side.set_track(None)?;
            swapped = true;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
