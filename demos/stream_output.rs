extern crate env_logger;
extern crate mediamux;
extern crate mediamux_gstreamer;

use mediamux::streams::{
    BaseTrackInput, MediaContextOptions, MediaStream, MediaStreamTrack, StandaloneStreamOutput,
};
use mediamux::{AudioWave, MediaError, MediaMux, VideoPattern};
use mediamux_gstreamer::GStreamerBackend;
use std::time::{Duration, Instant};

fn run() -> Result<(), MediaError> {
    MediaMux::init::<GStreamerBackend>()?;
    let context = MediaMux::get()?.create_context(MediaContextOptions::default())?;

    let audio = BaseTrackInput::test_audio(&context, AudioWave::Sine)?;
    let video = BaseTrackInput::test_video(&context, VideoPattern::Snow)?;
    let audio = MediaStreamTrack::new(&context, audio)?;
    let video = MediaStreamTrack::new(&context, video)?;
    let stream = MediaStream::new(&[video]);

    let output = StandaloneStreamOutput::new(&context);
    output.set_src_object(Some(&stream));

    let start = Instant::now();
    let mut added = false;
    while start.elapsed() < Duration::from_secs(8) {
        context.dispatch_timeout(Duration::from_millis(100));
        if !added && start.elapsed() > Duration::from_secs(3) {
            log::info!("Adding {} to the stream", audio.label());
            stream.add_track(&audio);
            added = true;
        }
    }
    output.set_src_object(None);
    context.dispatch_timeout(Duration::from_millis(500));
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
