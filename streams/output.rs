//! Leaf consumers rendering tracks in sub-graphs of their own.

use crate::context::{EngineEvent, EngineListener, ListenerId, MediaContext};
use crate::id::TrackId;
use crate::proxy::RelayOutput;
use crate::stream::{MediaStream, StreamEvent, StreamListenerId};
use crate::track::MediaStreamTrack;
use log::{debug, error, warn};
use mediamux_traits::{MediaError, MediaKind, PortDirection, PortId, StageId, StageKind, StageState};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Mutex;

#[derive(Clone, Copy)]
struct SinkGraph {
    graph: StageId,
    ingress: StageId,
    render: StageId,
    render_sink: PortId,
}

/// Renders at most one track at a time.
///
/// The rendering sub-graph is built on the first bind and kept around
/// afterwards; unbinding drains it and parks it idle.
pub struct StandaloneTrackOutput {
    context: Rc<MediaContext>,
    name: String,
    kind: MediaKind,
    listener: ListenerId,
    sink_graph: Cell<Option<SinkGraph>>,
    binding: RefCell<Option<(Rc<MediaStreamTrack>, RelayOutput)>>,
    draining: Cell<bool>,
}

impl StandaloneTrackOutput {
    pub fn new(context: &Rc<MediaContext>, kind: MediaKind) -> Rc<StandaloneTrackOutput> {
        let name = context.unique_name("StandaloneTrackOutput");
        Rc::new_cyclic(|weak: &Weak<StandaloneTrackOutput>| StandaloneTrackOutput {
            context: context.clone(),
            name,
            kind,
            listener: context.register_listener(weak.clone()),
            sink_graph: Cell::new(None),
            binding: RefCell::new(None),
            draining: Cell::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Option<Rc<MediaStreamTrack>> {
        self.binding.borrow().as_ref().map(|(track, _)| track.clone())
    }

    /// The rendering sub-graph, if it was ever built.
    pub fn sink_graph(&self) -> Option<StageId> {
        self.sink_graph.get().map(|g| g.graph)
    }

    pub fn render_stage(&self) -> Option<StageId> {
        self.sink_graph.get().map(|g| g.render)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.get()
    }

    pub fn set_track(&self, track: Option<&Rc<MediaStreamTrack>>) -> Result<(), MediaError> {
        let current = self.track();
        let unchanged = match (&current, track) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        if let Some(track) = track {
            if track.kind() != self.kind {
                error!(
                    "{}: cannot render a {} track",
                    self.name,
                    track.kind()
                );
                return Err(MediaError::InvalidArgument(format!(
                    "{} track on a {} output",
                    track.kind(),
                    self.kind
                )));
            }
        }

        if let Some(track) = track {
            if track.ended() {
                error!("{}: {} has ended", self.name, track.name());
                return Err(MediaError::Precondition(format!(
                    "{} has ended",
                    track.name()
                )));
            }
        }

        let was_bound = current.is_some();
        if was_bound && track.is_none() {
            self.drain()?;
        }
        self.detach()?;

        if let Some(track) = track {
            if let Err(e) = self.attach(track) {
                self.restore(current.as_ref());
                return Err(e);
            }
            if !was_bound {
                self.activate()?;
            }
        }
        Ok(())
    }

    /// Binds `previous` again after a failed switch away from it.
    fn restore(&self, previous: Option<&Rc<MediaStreamTrack>>) {
        if let Some(previous) = previous {
            if let Err(e) = self.attach(previous) {
                error!(
                    "{}: cannot rebind {}: {}",
                    self.name,
                    previous.name(),
                    e
                );
            }
        }
    }

    fn drain(&self) -> Result<(), MediaError> {
        if let Some(sink_graph) = self.sink_graph.get() {
            self.draining.set(true);
            self.context
                .backend()
                .send_end_of_stream(sink_graph.render_sink)?;
            debug!("{}: draining", self.name);
        }
        Ok(())
    }

    fn detach(&self) -> Result<(), MediaError> {
        let binding = self.binding.borrow_mut().take();
        if let Some((track, output)) = binding {
            if let Err(e) = track.remove_output(output) {
                error!("{}: cannot detach from {}: {}", self.name, track.name(), e);
                *self.binding.borrow_mut() = Some((track, output));
                return Err(e);
            }
        }
        Ok(())
    }

    fn attach(&self, track: &Rc<MediaStreamTrack>) -> Result<(), MediaError> {
        let sink_graph = self.ensure_sink_graph()?;
        let output = track.add_output()?;
        if let Err(e) = self
            .context
            .backend()
            .pair_relay(sink_graph.ingress, output.egress())
        {
            if let Err(e) = track.remove_output(output) {
                warn!("{}: {}", self.name, e);
            }
            return Err(e);
        }
        *self.binding.borrow_mut() = Some((track.clone(), output));
        Ok(())
    }

    fn activate(&self) -> Result<(), MediaError> {
        let graph = match self.sink_graph.get() {
            Some(sink_graph) => sink_graph.graph,
            None => return Ok(()),
        };
        let backend = self.context.backend();
        // A sink that saw end-of-stream only accepts data again after a reset.
        if self.draining.replace(false) {
            backend.set_state(graph, StageState::Idle)?;
        }
        backend.use_shared_clock(graph)?;
        backend.set_state(graph, StageState::Running)?;
        debug!("{}: running", self.name);
        Ok(())
    }

    fn ensure_sink_graph(&self) -> Result<SinkGraph, MediaError> {
        if let Some(sink_graph) = self.sink_graph.get() {
            return Ok(sink_graph);
        }
        let backend = self.context.backend();
        let graph = backend.create_graph(&format!("{}_sinkBin", self.name))?;
        match self.build_sink_graph(graph) {
            Ok(sink_graph) => {
                self.sink_graph.set(Some(sink_graph));
                Ok(sink_graph)
            },
            Err(e) => {
                let _ = backend.remove_stage(graph);
                Err(e)
            },
        }
    }

    fn build_sink_graph(&self, graph: StageId) -> Result<SinkGraph, MediaError> {
        let backend = self.context.backend();
        let ingress = backend.create_stage(
            graph,
            &StageKind::RelayIngress,
            &format!("{}_proxySrc", self.name),
        )?;
        let render = backend.create_stage(
            graph,
            &StageKind::Render(self.kind),
            &format!("{}_render", self.name),
        )?;
        let render_sink = backend.static_port(render, PortDirection::Sink)?;
        backend.link(
            backend.static_port(ingress, PortDirection::Src)?,
            render_sink,
        )?;

        let notifier = Mutex::new(self.context.notifier(self.listener));
        backend.connect_end_of_stream(
            graph,
            Box::new(move || {
                if let Ok(notifier) = notifier.lock() {
                    notifier.notify(EngineEvent::EndOfStream);
                }
            }),
        )?;
        backend.set_state(graph, StageState::Idle)?;

        Ok(SinkGraph {
            graph,
            ingress,
            render,
            render_sink,
        })
    }

    fn handle_drained(&self) {
        if !self.draining.get() || self.binding.borrow().is_some() {
            return;
        }
        self.draining.set(false);
        if let Some(sink_graph) = self.sink_graph.get() {
            match self
                .context
                .backend()
                .set_state(sink_graph.graph, StageState::Idle)
            {
                Ok(()) => debug!("{}: drained, parked", self.name),
                Err(e) => warn!("{}: cannot park: {}", self.name, e),
            }
        }
    }
}

impl EngineListener for StandaloneTrackOutput {
    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::EndOfStream => self.handle_drained(),
            EngineEvent::NewOutputPort(_) => {},
        }
    }
}

impl Drop for StandaloneTrackOutput {
    fn drop(&mut self) {
        self.context.unregister_listener(self.listener);
        if let Err(e) = self.detach() {
            warn!("{}: {}", self.name, e);
        }
        if let Some(sink_graph) = self.sink_graph.get() {
            if let Err(e) = self.context.backend().remove_stage(sink_graph.graph) {
                warn!("Cannot remove {}_sinkBin: {}", self.name, e);
            }
        }
    }
}

/// Renders every track of a stream, following tracks added to and
/// removed from it.
pub struct StandaloneStreamOutput {
    context: Rc<MediaContext>,
    name: String,
    this: Weak<StandaloneStreamOutput>,
    stream: RefCell<Option<(Rc<MediaStream>, StreamListenerId)>>,
    outputs: RefCell<Vec<(TrackId, Rc<StandaloneTrackOutput>)>>,
}

impl StandaloneStreamOutput {
    pub fn new(context: &Rc<MediaContext>) -> Rc<StandaloneStreamOutput> {
        let name = context.unique_name("StandaloneStreamOutput");
        Rc::new_cyclic(|weak| StandaloneStreamOutput {
            context: context.clone(),
            name,
            this: weak.clone(),
            stream: RefCell::new(None),
            outputs: RefCell::new(vec![]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn src_object(&self) -> Option<Rc<MediaStream>> {
        self.stream.borrow().as_ref().map(|(s, _)| s.clone())
    }

    pub fn set_src_object(&self, stream: Option<&Rc<MediaStream>>) {
        if let Some((old, listener)) = self.stream.borrow_mut().take() {
            old.remove_listener(listener);
        }
        let outputs: Vec<_> = self.outputs.borrow_mut().drain(..).collect();
        for (_, output) in outputs {
            if let Err(e) = output.set_track(None) {
                warn!("{}: {}", self.name, e);
            }
        }

        if let Some(stream) = stream {
            for track in stream.get_tracks() {
                self.add_track(&track);
            }
            let this = self.this.clone();
            let listener = stream.add_listener(Box::new(move |event, track| {
                if let Some(this) = this.upgrade() {
                    match event {
                        StreamEvent::AddTrack => this.add_track(track),
                        StreamEvent::RemoveTrack => this.remove_track(track),
                    }
                }
            }));
            *self.stream.borrow_mut() = Some((stream.clone(), listener));
        }
    }

    pub fn output_count(&self) -> usize {
        self.outputs.borrow().len()
    }

    pub fn output_for(&self, id: TrackId) -> Option<Rc<StandaloneTrackOutput>> {
        self.outputs
            .borrow()
            .iter()
            .find(|(track, _)| *track == id)
            .map(|(_, output)| output.clone())
    }

    fn add_track(&self, track: &Rc<MediaStreamTrack>) {
        if self.output_for(track.id()).is_some() {
            warn!("{}: track {} already exists?", self.name, track.id());
            return;
        }
        let output = StandaloneTrackOutput::new(&self.context, track.kind());
        if let Err(e) = output.set_track(Some(track)) {
            warn!("{}: cannot play track {}: {}", self.name, track.id(), e);
            return;
        }
        self.outputs.borrow_mut().push((track.id(), output));
    }

    fn remove_track(&self, track: &Rc<MediaStreamTrack>) {
        let index = self
            .outputs
            .borrow()
            .iter()
            .position(|(id, _)| *id == track.id());
        let output = match index {
            Some(index) => self.outputs.borrow_mut().remove(index).1,
            None => {
                warn!(
                    "{}: trying to remove non-existent track {}?",
                    self.name,
                    track.id()
                );
                return;
            },
        };
        if let Err(e) = output.set_track(None) {
            warn!("{}: {}", self.name, e);
        }
    }
}

impl Drop for StandaloneStreamOutput {
    fn drop(&mut self) {
        if let Some((stream, listener)) = self.stream.borrow_mut().take() {
            stream.remove_listener(listener);
        }
    }
}
