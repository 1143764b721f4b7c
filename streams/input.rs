//! Producers: the sources tracks are fed from.

use crate::context::{EngineEvent, EngineListener, ListenerId, MediaContext};
use crate::id::TrackId;
use crate::tee::TeeMultiplexer;
use crate::track::{MediaStreamTrack, TrackEvent, TrackInput};
use log::{debug, error, warn};
use mediamux_traits::{
    AudioWave, MediaError, MediaKind, PortDirection, PortId, SourceSpec, StageId, StageKind,
    StageState, VideoPattern,
};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Mutex;

/// Bookkeeping shared by every producer: the fan-out towards tracks,
/// the connected tracks and the usage counter.
struct InputCore {
    name: String,
    tee: TeeMultiplexer,
    tracks: RefCell<Vec<(TrackId, Weak<MediaStreamTrack>)>>,
    usage: Cell<usize>,
}

impl InputCore {
    fn new(context: &MediaContext, upstream: PortId, name: &str) -> Result<InputCore, MediaError> {
        let tee = TeeMultiplexer::new(
            context.backend(),
            context.graph(),
            upstream,
            &format!("{}_tee", name),
        )?;
        Ok(InputCore {
            name: name.to_owned(),
            tee,
            tracks: RefCell::new(vec![]),
            usage: Cell::new(0),
        })
    }

    fn connect(&self, track: &Rc<MediaStreamTrack>) -> Result<(), MediaError> {
        if self.tracks.borrow().iter().any(|(id, _)| *id == track.id()) {
            return Ok(());
        }
        self.tee.add_branch(track.sink_port())?;
        self.tracks
            .borrow_mut()
            .push((track.id(), Rc::downgrade(track)));
        Ok(())
    }

    fn disconnect(&self, track: &MediaStreamTrack) -> Result<(), MediaError> {
        let index = self
            .tracks
            .borrow()
            .iter()
            .position(|(id, _)| *id == track.id());
        let index = match index {
            Some(index) => index,
            None => {
                warn!("{}: disconnect a non-connected track {}?", self.name, track.id());
                return Ok(());
            },
        };
        match self.tee.remove_branch(track.sink_port()) {
            Ok(()) | Err(MediaError::NotAConsumer) => {},
            Err(e) => return Err(e),
        }
        self.tracks.borrow_mut().remove(index);
        Ok(())
    }

    fn release(&self) -> Result<usize, MediaError> {
        let usage = self.usage.get();
        if usage == 0 {
            error!("{}: stopped more often than started", self.name);
            return Err(MediaError::Precondition(format!(
                "{} is not in use",
                self.name
            )));
        }
        self.usage.set(usage - 1);
        Ok(usage - 1)
    }

    fn live_tracks(&self) -> Vec<Rc<MediaStreamTrack>> {
        self.tracks
            .borrow()
            .iter()
            .filter_map(|(_, track)| track.upgrade())
            .collect()
    }

    fn notify(&self, event: TrackEvent) {
        for track in self.live_tracks() {
            track.dispatch_event(event);
        }
    }
}

/// A producer wrapping one concrete source stage.
///
/// The source is locked out of the shared graph's state changes and only
/// runs while at least one track has an output.
pub struct BaseTrackInput {
    context: Rc<MediaContext>,
    kind: MediaKind,
    label: String,
    source: StageId,
    muted: Cell<bool>,
    core: InputCore,
}

impl BaseTrackInput {
    pub fn new(
        context: &Rc<MediaContext>,
        spec: SourceSpec,
        name: &str,
        label: &str,
    ) -> Result<Rc<BaseTrackInput>, MediaError> {
        let backend = context.backend();
        let source = backend.create_stage(
            context.graph(),
            &StageKind::Source(spec),
            &format!("{}_source", name),
        )?;
        // Kept idle until something connects to it.
        backend.set_locked_state(source, true);
        let core = backend
            .set_state(source, StageState::Idle)
            .and_then(|_| backend.static_port(source, PortDirection::Src))
            .and_then(|port| InputCore::new(context, port, name));
        let core = match core {
            Ok(core) => core,
            Err(e) => {
                let _ = backend.remove_stage(source);
                return Err(e);
            },
        };

        Ok(Rc::new(BaseTrackInput {
            context: context.clone(),
            kind: spec.kind(),
            label: label.to_owned(),
            source,
            muted: Cell::new(false),
            core,
        }))
    }

    pub fn test_audio(
        context: &Rc<MediaContext>,
        wave: AudioWave,
    ) -> Result<Rc<BaseTrackInput>, MediaError> {
        let name = context.unique_name("TestAudioTrackInput");
        BaseTrackInput::new(
            context,
            SourceSpec::TestAudio { wave },
            &name,
            "audio test source",
        )
    }

    pub fn test_video(
        context: &Rc<MediaContext>,
        pattern: VideoPattern,
    ) -> Result<Rc<BaseTrackInput>, MediaError> {
        let name = context.unique_name("TestVideoTrackInput");
        BaseTrackInput::new(
            context,
            SourceSpec::TestVideo { pattern },
            &name,
            "video test source",
        )
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Only notifies connected tracks; data keeps flowing.
    pub fn set_muted(&self, muted: bool) {
        if self.muted.replace(muted) == muted {
            return;
        }
        self.core.notify(if muted {
            TrackEvent::Mute
        } else {
            TrackEvent::Unmute
        });
    }

    pub fn usage_count(&self) -> usize {
        self.core.usage.get()
    }

    pub fn is_running(&self) -> bool {
        self.context.backend().state(self.source) == Some(StageState::Running)
    }

    pub fn source_stage(&self) -> StageId {
        self.source
    }

    pub fn branch_count(&self) -> usize {
        self.core.tee.branch_count()
    }
}

impl TrackInput for BaseTrackInput {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn muted(&self) -> bool {
        self.muted.get()
    }

    fn connect(&self, track: &Rc<MediaStreamTrack>) -> Result<(), MediaError> {
        self.core.connect(track)
    }

    fn disconnect(&self, track: &MediaStreamTrack) -> Result<(), MediaError> {
        self.core.disconnect(track)
    }

    fn start(&self) -> Result<(), MediaError> {
        let usage = self.core.usage.get();
        if usage == 0 {
            self.context
                .backend()
                .set_state(self.source, StageState::Running)?;
            debug!("{} running", self.core.name);
        }
        self.core.usage.set(usage + 1);
        Ok(())
    }

    fn stop(&self) -> Result<(), MediaError> {
        if self.core.release()? == 0 {
            // Still allocated, ready for the next client.
            self.context
                .backend()
                .set_state(self.source, StageState::Idle)?;
            debug!("{} idle", self.core.name);
        }
        Ok(())
    }
}

impl Drop for BaseTrackInput {
    fn drop(&mut self) {
        if let Err(e) = self.context.backend().remove_stage(self.source) {
            warn!("Cannot remove {}_source: {}", self.core.name, e);
        }
    }
}

/// A producer fed by an incoming port whose format is only known once
/// data arrives.
///
/// It starts muted, feeding silence or black frames. When the decode stage
/// exposes its output the fan-out is switched over to it and the tracks
/// are unmuted. Its lifetime is owned by whatever feeds the incoming port,
/// so `start` and `stop` only keep count.
pub struct RemoteTrackInput {
    context: Rc<MediaContext>,
    kind: MediaKind,
    label: String,
    listener: ListenerId,
    placeholder: Cell<Option<StageId>>,
    decode: Cell<Option<StageId>>,
    core: InputCore,
}

impl RemoteTrackInput {
    pub fn new(
        context: &Rc<MediaContext>,
        kind: MediaKind,
    ) -> Result<Rc<RemoteTrackInput>, MediaError> {
        let backend = context.backend();
        let name = context.unique_name("RemoteTrackInput");
        let placeholder = backend.create_stage(
            context.graph(),
            &StageKind::Source(SourceSpec::placeholder(kind)),
            &format!("{}_placeholder", name),
        )?;
        let core = backend
            .static_port(placeholder, PortDirection::Src)
            .and_then(|port| InputCore::new(context, port, &name))
            .and_then(|core| {
                backend.sync_state_with_parent(placeholder)?;
                Ok(core)
            });
        let core = match core {
            Ok(core) => core,
            Err(e) => {
                let _ = backend.remove_stage(placeholder);
                return Err(e);
            },
        };

        Ok(Rc::new_cyclic(|weak: &Weak<RemoteTrackInput>| {
            let listener = context.register_listener(weak.clone());
            RemoteTrackInput {
                context: context.clone(),
                kind,
                label: format!("remote {}", kind),
                listener,
                placeholder: Cell::new(Some(placeholder)),
                decode: Cell::new(None),
                core,
            }
        }))
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Feeds the incoming `port` into a decode stage. Must be called once.
    pub fn connect_to_port(&self, port: PortId) -> Result<(), MediaError> {
        if self.decode.get().is_some() {
            error!("{} is already connected to a port", self.core.name);
            return Err(MediaError::Precondition(format!(
                "{} already has an incoming port",
                self.core.name
            )));
        }

        let backend = self.context.backend();
        let decode = backend.create_stage(
            self.context.graph(),
            &StageKind::Decode,
            &format!("{}_decode", self.core.name),
        )?;
        if let Err(e) = self.plug_decode(decode, port) {
            let _ = backend.remove_stage(decode);
            return Err(e);
        }
        self.decode.set(Some(decode));
        Ok(())
    }

    fn plug_decode(&self, decode: StageId, port: PortId) -> Result<(), MediaError> {
        let backend = self.context.backend();
        let sink = backend.static_port(decode, PortDirection::Sink)?;
        backend.link(port, sink)?;

        // The callback runs on a streaming thread and needs Sync.
        let notifier = Mutex::new(self.context.notifier(self.listener));
        backend.connect_new_output_port(
            decode,
            Box::new(move |port| {
                if let Ok(notifier) = notifier.lock() {
                    notifier.notify(EngineEvent::NewOutputPort(port));
                }
            }),
        )?;
        backend.sync_state_with_parent(decode)
    }

    /// The remote side is gone: every connected track ends.
    pub fn end(&self) {
        debug!("{} ended", self.core.name);
        for track in self.core.live_tracks() {
            track.end_from_input();
        }
    }

    pub fn usage_count(&self) -> usize {
        self.core.usage.get()
    }

    pub fn branch_count(&self) -> usize {
        self.core.tee.branch_count()
    }

    pub fn decode_stage(&self) -> Option<StageId> {
        self.decode.get()
    }

    fn handle_new_port(&self, port: PortId) {
        let placeholder = match self.placeholder.get() {
            Some(placeholder) => placeholder,
            None => {
                debug!("{}: ignoring extra output {}", self.core.name, port.0);
                return;
            },
        };

        if let Err(e) = self.core.tee.change_upstream(port) {
            error!("{}: keeping placeholder: {}", self.core.name, e);
            return;
        }

        if let Err(e) = self.context.backend().remove_stage(placeholder) {
            warn!("{}: cannot remove placeholder: {}", self.core.name, e);
        }
        self.placeholder.set(None);
        self.core.notify(TrackEvent::Unmute);
    }
}

impl EngineListener for RemoteTrackInput {
    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::NewOutputPort(port) => self.handle_new_port(port),
            EngineEvent::EndOfStream => {},
        }
    }
}

impl TrackInput for RemoteTrackInput {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn muted(&self) -> bool {
        self.placeholder.get().is_some()
    }

    fn connect(&self, track: &Rc<MediaStreamTrack>) -> Result<(), MediaError> {
        self.core.connect(track)
    }

    fn disconnect(&self, track: &MediaStreamTrack) -> Result<(), MediaError> {
        self.core.disconnect(track)
    }

    fn start(&self) -> Result<(), MediaError> {
        self.core.usage.set(self.core.usage.get() + 1);
        Ok(())
    }

    fn stop(&self) -> Result<(), MediaError> {
        self.core.release().map(|_| ())
    }
}

impl Drop for RemoteTrackInput {
    fn drop(&mut self) {
        self.context.unregister_listener(self.listener);
        let backend = self.context.backend();
        for stage in self.decode.get().into_iter().chain(self.placeholder.get()) {
            if let Err(e) = backend.remove_stage(stage) {
                warn!("{}: {}", self.core.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::setup;
    use mediamux_traits::GraphBackend;

    fn incoming(context: &MediaContext) -> (StageId, PortId) {
        let backend = context.backend();
        let kind = StageKind::Source(SourceSpec::TestVideo {
            pattern: VideoPattern::Ball,
        });
        let stage = backend.create_stage(context.graph(), &kind, "incoming").unwrap();
        backend.sync_state_with_parent(stage).unwrap();
        (stage, backend.static_port(stage, PortDirection::Src).unwrap())
    }

    fn record_events(track: &MediaStreamTrack) -> Rc<RefCell<Vec<TrackEvent>>> {
        let events = Rc::new(RefCell::new(vec![]));
        for event in [TrackEvent::Ended, TrackEvent::Mute, TrackEvent::Unmute] {
            let events = events.clone();
            track.set_event_handler(
                event,
                Some(Box::new(move |_| events.borrow_mut().push(event))),
            );
        }
        events
    }

    #[test]
    fn test_source_is_locked_and_idle() {
        let (backend, context) = setup();
        let input = BaseTrackInput::test_audio(&context, AudioWave::Sine).unwrap();
        assert!(backend.is_locked(input.source_stage()));
        assert_eq!(backend.state(input.source_stage()), Some(StageState::Idle));
        assert_eq!(input.kind(), MediaKind::Audio);
        assert!(input.name().starts_with("TestAudioTrackInput"));
        assert!(!input.muted());
    }

    #[test]
    fn test_usage_count_drives_source_state() {
        let (backend, context) = setup();
        let input = BaseTrackInput::test_video(&context, VideoPattern::Snow).unwrap();
        input.start().unwrap();
        input.start().unwrap();
        assert_eq!(input.usage_count(), 2);
        assert_eq!(
            backend.state(input.source_stage()),
            Some(StageState::Running)
        );
        input.stop().unwrap();
        assert!(input.is_running());
        input.stop().unwrap();
        assert_eq!(backend.state(input.source_stage()), Some(StageState::Idle));
        assert!(backend.stage_exists(input.source_stage()));

        assert!(matches!(input.stop(), Err(MediaError::Precondition(_))));
        assert_eq!(input.usage_count(), 0);
    }

    #[test]
    fn test_connect_is_deduplicated() {
        let (_backend, context) = setup();
        let input = BaseTrackInput::test_video(&context, VideoPattern::Snow).unwrap();
        let track = MediaStreamTrack::new(&context, input.clone()).unwrap();
        input.connect(&track).unwrap();
        assert_eq!(input.branch_count(), 1);

        input.disconnect(&track).unwrap();
        assert_eq!(input.branch_count(), 0);
        // Unknown tracks are only warned about.
        input.disconnect(&track).unwrap();
    }

    #[test]
    fn test_mute_notifies_on_change_only() {
        let (_backend, context) = setup();
        let input = BaseTrackInput::test_video(&context, VideoPattern::Snow).unwrap();
        let track = MediaStreamTrack::new(&context, input.clone()).unwrap();
        let events = record_events(&track);

        input.set_muted(true);
        input.set_muted(true);
        assert!(track.muted());
        input.set_muted(false);
        assert_eq!(
            *events.borrow(),
            vec![TrackEvent::Mute, TrackEvent::Unmute]
        );
    }

    #[test]
    fn test_unavailable_source_leaves_nothing() {
        let (backend, context) = setup();
        let before = backend.stage_count();
        backend.fail_stage_creation(&StageKind::FanOut);
        assert!(matches!(
            BaseTrackInput::test_audio(&context, AudioWave::Sine),
            Err(MediaError::Unavailable(_))
        ));
        assert_eq!(backend.stage_count(), before);
    }

    #[test]
    fn test_remote_input_switches_to_decoded_output() {
        let (backend, context) = setup();
        let remote = RemoteTrackInput::new(&context, MediaKind::Video).unwrap();
        let track = MediaStreamTrack::new(&context, remote.clone()).unwrap();
        let events = record_events(&track);
        assert!(track.muted());
        assert_eq!(track.label(), "remote video");

        let (source, port) = incoming(&context);
        remote.connect_to_port(port).unwrap();
        let decode = remote.decode_stage().unwrap();
        let output = backend.discover_output_port(decode).unwrap();

        // Nothing changes until the control loop runs.
        assert!(track.muted());
        assert_eq!(context.dispatch_pending(), 1);
        assert!(!track.muted());
        assert_eq!(*events.borrow(), vec![TrackEvent::Unmute]);
        let fed = backend.peer(output).and_then(|p| backend.port_owner(p));
        assert_eq!(fed, Some(remote.core.tee.stage()));
        assert_eq!(
            backend.find_stage(&format!("{}_placeholder", remote.name())),
            None
        );

        // A second output is ignored.
        backend.discover_output_port(decode).unwrap();
        context.dispatch_pending();
        assert_eq!(events.borrow().len(), 1);

        let render = {
            let graph = backend.create_graph("render").unwrap();
            let ingress = backend
                .create_stage(graph, &StageKind::RelayIngress, "ingress")
                .unwrap();
            let render = backend
                .create_stage(graph, &StageKind::Render(MediaKind::Video), "render")
                .unwrap();
            backend
                .link(
                    backend.static_port(ingress, PortDirection::Src).unwrap(),
                    backend.static_port(render, PortDirection::Sink).unwrap(),
                )
                .unwrap();
            backend
                .pair_relay(ingress, track.add_output().unwrap().egress())
                .unwrap();
            backend.set_state(graph, StageState::Running).unwrap();
            render
        };
        assert_eq!(backend.push_buffer(source), 1);
        assert_eq!(backend.rendered(render), 1);
        assert_eq!(remote.usage_count(), 1);
    }

    #[test]
    fn test_failed_switch_keeps_placeholder() {
        let (backend, context) = setup();
        let remote = RemoteTrackInput::new(&context, MediaKind::Audio).unwrap();
        let track = MediaStreamTrack::new(&context, remote.clone()).unwrap();
        let (_, port) = incoming(&context);
        remote.connect_to_port(port).unwrap();
        backend
            .discover_output_port(remote.decode_stage().unwrap())
            .unwrap();

        backend.fail_next_links(1);
        context.dispatch_pending();
        assert!(track.muted());
        assert!(backend
            .find_stage(&format!("{}_placeholder", remote.name()))
            .is_some());

        assert!(matches!(
            remote.connect_to_port(port),
            Err(MediaError::Precondition(_))
        ));
    }

    #[test]
    fn test_remote_end_ends_tracks() {
        let (_backend, context) = setup();
        let remote = RemoteTrackInput::new(&context, MediaKind::Audio).unwrap();
        let track = MediaStreamTrack::new(&context, remote.clone()).unwrap();
        let clone = track.clone_track().unwrap();
        let events = record_events(&track);

        remote.end();
        assert!(track.ended());
        assert!(clone.ended());
        assert_eq!(*events.borrow(), vec![TrackEvent::Ended]);
        assert!(matches!(
            track.add_output(),
            Err(MediaError::Precondition(_))
        ));
    }

    #[test]
    fn test_dropped_remote_input_is_forgotten() {
        let (backend, context) = setup();
        let remote = RemoteTrackInput::new(&context, MediaKind::Audio).unwrap();
        let (_, port) = incoming(&context);
        remote.connect_to_port(port).unwrap();
        let decode = remote.decode_stage().unwrap();
        drop(remote);

        assert!(!backend.stage_exists(decode));
        assert_eq!(backend.peer(port), None);
        assert_eq!(context.dispatch_pending(), 0);
    }
}
