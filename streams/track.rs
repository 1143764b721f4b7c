use crate::context::MediaContext;
use crate::id::TrackId;
use crate::proxy::{ProxyMultiplexer, RelayOutput};
use log::{debug, error, warn};
use mediamux_traits::{MediaError, MediaKind, PortDirection, PortId, StageId, StageKind};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TrackEvent {
    Ended,
    Mute,
    Unmute,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadyState {
    Live,
    Ended,
}

/// A producer a track can be backed by.
///
/// `start` and `stop` are driven by tracks gaining their first output and
/// losing their last one. Implementations count them and keep the source
/// running while the count is positive.
pub trait TrackInput {
    fn kind(&self) -> MediaKind;
    fn label(&self) -> &str;
    fn muted(&self) -> bool;
    /// Feeds the track's sink port from this producer.
    fn connect(&self, track: &Rc<MediaStreamTrack>) -> Result<(), MediaError>;
    fn disconnect(&self, track: &MediaStreamTrack) -> Result<(), MediaError>;
    fn start(&self) -> Result<(), MediaError>;
    fn stop(&self) -> Result<(), MediaError>;
}

type EventHandler = Rc<dyn Fn(&MediaStreamTrack)>;

pub struct MediaStreamTrack {
    id: TrackId,
    name: String,
    context: Rc<MediaContext>,
    input: Rc<dyn TrackInput>,
    queue: StageId,
    sink: PortId,
    relay: ProxyMultiplexer,
    enabled: Cell<bool>,
    ended: Cell<bool>,
    connected: Cell<bool>,
    content_hint: RefCell<String>,
    handlers: RefCell<HashMap<TrackEvent, EventHandler>>,
}

impl MediaStreamTrack {
    pub fn new(
        context: &Rc<MediaContext>,
        input: Rc<dyn TrackInput>,
    ) -> Result<Rc<MediaStreamTrack>, MediaError> {
        MediaStreamTrack::with_state(context, input, true, false)
    }

    fn with_state(
        context: &Rc<MediaContext>,
        input: Rc<dyn TrackInput>,
        enabled: bool,
        ended: bool,
    ) -> Result<Rc<MediaStreamTrack>, MediaError> {
        let id = TrackId::new();
        let name = format!("MediaStreamTrack_{}", &id.to_string()[..8]);
        let backend = context.backend();

        let queue = backend.create_stage(
            context.graph(),
            &StageKind::Buffer(context.options().queue),
            &format!("{}_queue", name),
        )?;
        let ports = backend.sync_state_with_parent(queue).and_then(|_| {
            Ok((
                backend.static_port(queue, PortDirection::Sink)?,
                backend.static_port(queue, PortDirection::Src)?,
            ))
        });
        let relay = ports.and_then(|(sink, src)| {
            Ok((
                sink,
                ProxyMultiplexer::new(backend, context.graph(), src, &name)?,
            ))
        });
        let (sink, relay) = match relay {
            Ok(r) => r,
            Err(e) => {
                let _ = backend.remove_stage(queue);
                return Err(e);
            },
        };

        let track = Rc::new(MediaStreamTrack {
            id,
            name,
            context: context.clone(),
            input,
            queue,
            sink,
            relay,
            enabled: Cell::new(enabled),
            ended: Cell::new(ended),
            connected: Cell::new(false),
            content_hint: RefCell::new(String::new()),
            handlers: RefCell::new(HashMap::new()),
        });
        track.input.connect(&track)?;
        track.connected.set(true);
        debug!("{} created for {}", track.name, track.input.label());
        Ok(track)
    }

    /// A new track fed by the same producer, with its own buffering and
    /// fan-out. It starts from this track's enabled and ended flags.
    pub fn clone_track(&self) -> Result<Rc<MediaStreamTrack>, MediaError> {
        MediaStreamTrack::with_state(
            &self.context,
            self.input.clone(),
            self.enabled.get(),
            self.ended.get(),
        )
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MediaKind {
        self.input.kind()
    }

    pub fn label(&self) -> String {
        self.input.label().to_owned()
    }

    pub fn muted(&self) -> bool {
        self.input.muted()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn content_hint(&self) -> String {
        self.content_hint.borrow().clone()
    }

    pub fn set_content_hint(&self, hint: &str) {
        *self.content_hint.borrow_mut() = hint.to_owned();
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.ended.get() {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    pub fn ended(&self) -> bool {
        self.ended.get()
    }

    /// Marks the track ended. Attached outputs are left alone and the
    /// `Ended` handler is not called.
    pub fn stop(&self) {
        if self.ended.get() {
            return;
        }
        self.ended.set(true);
        debug!("{} stopped", self.name);
    }

    /// Attaches a new consumer. The producer is started when this is the
    /// first output of the track.
    pub fn add_output(&self) -> Result<RelayOutput, MediaError> {
        if self.ended.get() {
            error!("{}: cannot add an output to an ended track", self.name);
            return Err(MediaError::Precondition(format!(
                "{} has ended",
                self.name
            )));
        }

        let output = self.relay.add_output()?;
        if self.relay.output_count() == 1 {
            if let Err(e) = self.input.start() {
                error!("{}: cannot start {}: {}", self.name, self.input.label(), e);
                if let Err(e) = self.relay.remove_output(output) {
                    warn!("{}: cannot roll back output: {}", self.name, e);
                }
                return Err(e);
            }
        }
        Ok(output)
    }

    /// Detaches a consumer. The producer is stopped once the relay has
    /// dropped the last output.
    pub fn remove_output(&self, output: RelayOutput) -> Result<(), MediaError> {
        self.relay.remove_output(output)?;
        if self.relay.output_count() == 0 {
            self.input.stop()?;
        }
        Ok(())
    }

    pub fn output_count(&self) -> usize {
        self.relay.output_count()
    }

    /// Live branches of this track's own fan-out.
    pub fn branch_count(&self) -> usize {
        self.relay.tee().branch_count()
    }

    pub fn set_event_handler(
        &self,
        event: TrackEvent,
        handler: Option<Box<dyn Fn(&MediaStreamTrack)>>,
    ) {
        let mut handlers = self.handlers.borrow_mut();
        match handler {
            Some(handler) => {
                handlers.insert(event, Rc::from(handler));
            },
            None => {
                handlers.remove(&event);
            },
        }
    }

    pub(crate) fn sink_port(&self) -> PortId {
        self.sink
    }

    pub(crate) fn queue(&self) -> StageId {
        self.queue
    }

    pub(crate) fn dispatch_event(&self, event: TrackEvent) {
        let handler = self.handlers.borrow().get(&event).cloned();
        if let Some(handler) = handler {
            handler(self);
        }
    }

    /// The producer will not deliver anything anymore.
    pub(crate) fn end_from_input(&self) {
        if self.ended.get() {
            return;
        }
        self.ended.set(true);
        self.dispatch_event(TrackEvent::Ended);
    }
}

impl Drop for MediaStreamTrack {
    fn drop(&mut self) {
        if self.relay.output_count() > 0 {
            if let Err(e) = self.input.stop() {
                warn!("{}: {}", self.name, e);
            }
        }
        if self.connected.get() {
            if let Err(e) = self.input.disconnect(self) {
                warn!("{}: cannot disconnect: {}", self.name, e);
            }
        }
        if let Err(e) = self.context.backend().remove_stage(self.queue) {
            warn!("Cannot remove {}_queue: {}", self.name, e);
        }
    }
}
