/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `GraphBackend` on top of GStreamer.
//!
//! Sub-graphs are pipelines, stages are elements (or small bins for the
//! render stages) and ports are pads. Handles are kept in a registry so
//! that the core never sees a GStreamer object.

use gst::prelude::*;
use log::{debug, warn};
use mediamux_traits::{
    BackendInit, GraphBackend, MediaError, MediaKind, NotifyCallback, PortCallback, PortDirection,
    PortId, ProbeId, SourceSpec, StageId, StageKind, StageState,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Registry {
    next_id: u64,
    stages: HashMap<StageId, gst::Element>,
    ports: HashMap<PortId, gst::Pad>,
    probes: HashMap<ProbeId, (PortId, gst::PadProbeId)>,
    eos_callbacks: HashMap<StageId, Vec<Arc<NotifyCallback>>>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_stage(&mut self, element: gst::Element) -> StageId {
        let id = StageId(self.next_id());
        self.stages.insert(id, element);
        id
    }

    fn stage_of(&self, element: &gst::Element) -> Option<StageId> {
        self.stages
            .iter()
            .find(|(_, e)| *e == element)
            .map(|(id, _)| *id)
    }

    /// The handle of `pad`, registering it the first time it is seen.
    fn port_of(&mut self, pad: &gst::Pad) -> PortId {
        if let Some(id) = self.ports.iter().find(|(_, p)| *p == pad).map(|(id, _)| *id) {
            return id;
        }
        let id = PortId(self.next_id());
        self.ports.insert(id, pad.clone());
        id
    }

    fn forget(&mut self, element: &gst::Element) {
        let inside = |e: &gst::Element| e == element || e.has_as_ancestor(element);
        self.stages.retain(|_, e| !inside(&*e));
        self.ports
            .retain(|_, pad| !pad.parent_element().map_or(false, |e| inside(&e)));
        let ports = &self.ports;
        self.probes.retain(|_, entry| ports.contains_key(&entry.0));
    }

    /// Drops `port` and the probes installed on it.
    fn forget_port(&mut self, port: PortId) {
        self.ports.remove(&port);
        self.probes.retain(|_, (p, _)| *p != port);
    }
}

fn unavailable(factory: &str, e: glib::BoolError) -> MediaError {
    MediaError::Unavailable(format!("{}: {}", factory, e))
}

fn backend_error<E: std::fmt::Debug>(what: &str, e: E) -> MediaError {
    MediaError::Backend(format!("{}: {:?}", what, e))
}

fn to_gst_state(state: StageState) -> gst::State {
    match state {
        StageState::Idle => gst::State::Ready,
        StageState::Ready => gst::State::Paused,
        StageState::Running => gst::State::Playing,
    }
}

fn render_bin(kind: MediaKind, name: &str) -> Result<gst::Element, MediaError> {
    let factories: &[&str] = match kind {
        MediaKind::Video => &["videoscale", "videoconvert", "autovideosink"],
        MediaKind::Audio => &["audioconvert", "audioresample", "autoaudiosink"],
    };
    let bin = gst::Bin::with_name(name);
    let mut elements = Vec::with_capacity(factories.len());
    for factory in factories {
        let element = gst::ElementFactory::make(factory)
            .build()
            .map_err(|e| unavailable(factory, e))?;
        elements.push(element);
    }
    bin.add_many(&elements)
        .map_err(|e| backend_error("cannot fill render bin", e))?;
    gst::Element::link_many(&elements).map_err(|e| backend_error("cannot link render bin", e))?;

    let target = elements[0]
        .static_pad("sink")
        .ok_or_else(|| MediaError::Backend(format!("{} has no sink pad", factories[0])))?;
    let ghost = gst::GhostPad::with_target(&target)
        .map_err(|e| backend_error("cannot create ghost pad", e))?;
    ghost
        .set_active(true)
        .map_err(|e| backend_error("cannot activate ghost pad", e))?;
    bin.add_pad(&ghost)
        .map_err(|e| backend_error("cannot add ghost pad", e))?;
    Ok(bin.upcast())
}

fn make_stage(kind: &StageKind, name: &str) -> Result<gst::Element, MediaError> {
    use gst::ElementFactory as Factory;

    let (factory, built) = match *kind {
        StageKind::FanOut => (
            "tee",
            Factory::make("tee")
                .name(name)
                .property("allow-not-linked", true)
                .build(),
        ),
        StageKind::Buffer(options) => (
            "queue",
            Factory::make("queue")
                .name(name)
                .property("max-size-buffers", options.max_buffers)
                .property("max-size-bytes", 0u32)
                .property("max-size-time", 0u64)
                .property_from_str("leaky", if options.leaky { "downstream" } else { "no" })
                .build(),
        ),
        StageKind::Source(SourceSpec::TestAudio { wave }) => (
            "audiotestsrc",
            Factory::make("audiotestsrc")
                .name(name)
                .property("is-live", true)
                .property_from_str("wave", wave.as_str())
                .build(),
        ),
        StageKind::Source(SourceSpec::TestVideo { pattern }) => (
            "videotestsrc",
            Factory::make("videotestsrc")
                .name(name)
                .property("is-live", true)
                .property_from_str("pattern", pattern.as_str())
                .build(),
        ),
        StageKind::Decode => ("decodebin", Factory::make("decodebin").name(name).build()),
        StageKind::Render(kind) => return render_bin(kind, name),
        StageKind::RelayEgress => ("proxysink", Factory::make("proxysink").name(name).build()),
        StageKind::RelayIngress => ("proxysrc", Factory::make("proxysrc").name(name).build()),
    };
    built.map_err(|e| unavailable(factory, e))
}

#[derive(Default)]
pub struct GStreamerBackend {
    registry: Arc<Mutex<Registry>>,
}

impl BackendInit for GStreamerBackend {
    fn init() -> Result<Arc<dyn GraphBackend>, MediaError> {
        gst::init().map_err(|e| MediaError::Backend(e.to_string()))?;
        Ok(Arc::new(GStreamerBackend::default()))
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<Registry> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl GStreamerBackend {
    // GStreamer may call back into us from the thread changing states,
    // so objects are cloned out and the lock is never held across a call.
    fn element(&self, stage: StageId) -> Result<gst::Element, MediaError> {
        lock(&self.registry)
            .stages
            .get(&stage)
            .cloned()
            .ok_or_else(|| MediaError::InvalidArgument(format!("unknown stage {:?}", stage)))
    }

    fn pad(&self, port: PortId) -> Result<gst::Pad, MediaError> {
        lock(&self.registry)
            .ports
            .get(&port)
            .cloned()
            .ok_or_else(|| MediaError::InvalidArgument(format!("unknown port {:?}", port)))
    }

    fn bin(&self, graph: StageId) -> Result<gst::Bin, MediaError> {
        self.element(graph)?
            .downcast::<gst::Bin>()
            .map_err(|_| MediaError::InvalidArgument(format!("{:?} is not a sub-graph", graph)))
    }

    fn factory_name(element: &gst::Element) -> String {
        element
            .factory()
            .map(|f| f.name().to_string())
            .unwrap_or_default()
    }
}

impl GraphBackend for GStreamerBackend {
    fn create_graph(&self, name: &str) -> Result<StageId, MediaError> {
        let pipeline = gst::Pipeline::with_name(name);
        let bus = pipeline
            .bus()
            .ok_or_else(|| MediaError::Backend("pipeline without bus".to_owned()))?;
        let id = lock(&self.registry).add_stage(pipeline.upcast());

        let registry = self.registry.clone();
        bus.set_sync_handler(move |_, msg| {
            match msg.view() {
                gst::MessageView::Eos(_) => {
                    let callbacks = lock(&registry)
                        .eos_callbacks
                        .get(&id)
                        .cloned()
                        .unwrap_or_default();
                    for callback in callbacks {
                        callback();
                    }
                },
                gst::MessageView::Error(err) => {
                    warn!("{:?}: {} ({:?})", id, err.error(), err.debug());
                },
                _ => (),
            }
            gst::BusSyncReply::Drop
        });
        Ok(id)
    }

    fn create_stage(
        &self,
        graph: StageId,
        kind: &StageKind,
        name: &str,
    ) -> Result<StageId, MediaError> {
        let bin = self.bin(graph)?;
        let element = make_stage(kind, name)?;
        bin.add(&element)
            .map_err(|e| backend_error(&format!("cannot add {}", name), e))?;
        debug!("Created {} ({:?})", name, kind);
        Ok(lock(&self.registry).add_stage(element))
    }

    fn remove_stage(&self, stage: StageId) -> Result<(), MediaError> {
        let element = self.element(stage)?;
        if let Some(pipeline) = element.downcast_ref::<gst::Pipeline>() {
            if let Some(bus) = pipeline.bus() {
                bus.unset_sync_handler();
            }
        }
        element
            .set_state(gst::State::Null)
            .map_err(|e| backend_error("cannot stop stage", e))?;
        if let Some(parent) = element.parent().and_then(|p| p.downcast::<gst::Bin>().ok()) {
            parent
                .remove(&element)
                .map_err(|e| backend_error("cannot detach stage", e))?;
        }

        let mut registry = lock(&self.registry);
        registry.forget(&element);
        registry.eos_callbacks.remove(&stage);
        Ok(())
    }

    fn stage_name(&self, stage: StageId) -> Option<String> {
        self.element(stage).ok().map(|e| e.name().to_string())
    }

    fn static_port(
        &self,
        stage: StageId,
        direction: PortDirection,
    ) -> Result<PortId, MediaError> {
        let element = self.element(stage)?;
        let pad = match direction {
            PortDirection::Src => element.static_pad("src"),
            PortDirection::Sink => element
                .static_pad("sink")
                .or_else(|| element.sink_pads().into_iter().next()),
        };
        let pad = pad.ok_or_else(|| {
            MediaError::InvalidArgument(format!("{} has no {:?} pad", element.name(), direction))
        })?;
        Ok(lock(&self.registry).port_of(&pad))
    }

    fn request_port(&self, stage: StageId) -> Result<PortId, MediaError> {
        let element = self.element(stage)?;
        let pad = element.request_pad_simple("src_%u").ok_or_else(|| {
            MediaError::InvalidArgument(format!("{} has no request pads", element.name()))
        })?;
        Ok(lock(&self.registry).port_of(&pad))
    }

    fn release_port(&self, stage: StageId, port: PortId) -> Result<(), MediaError> {
        let element = self.element(stage)?;
        let pad = self.pad(port)?;
        element.release_request_pad(&pad);
        lock(&self.registry).forget_port(port);
        Ok(())
    }

    fn port_owner(&self, port: PortId) -> Option<StageId> {
        let element = self.pad(port).ok()?.parent_element()?;
        lock(&self.registry).stage_of(&element)
    }

    fn peer(&self, port: PortId) -> Option<PortId> {
        let peer = self.pad(port).ok()?.peer()?;
        Some(lock(&self.registry).port_of(&peer))
    }

    fn link(&self, src: PortId, sink: PortId) -> Result<(), MediaError> {
        let (src, sink) = (self.pad(src)?, self.pad(sink)?);
        src.link(&sink)
            .map(|_| ())
            .map_err(|e| MediaError::Incompatible(format!("{:?}", e)))
    }

    fn unlink(&self, src: PortId, sink: PortId) -> Result<(), MediaError> {
        let (src, sink) = (self.pad(src)?, self.pad(sink)?);
        src.unlink(&sink)
            .map_err(|e| backend_error("cannot unlink", e))
    }

    fn install_flow_block_probe(&self, port: PortId) -> Result<ProbeId, MediaError> {
        let pad = self.pad(port)?;
        let probe = pad
            .add_probe(gst::PadProbeType::DATA_DOWNSTREAM, |_, _| {
                gst::PadProbeReturn::Drop
            })
            .ok_or_else(|| MediaError::Backend(format!("cannot probe {}", pad.name())))?;
        let mut registry = lock(&self.registry);
        let id = ProbeId(registry.next_id());
        registry.probes.insert(id, (port, probe));
        Ok(id)
    }

    fn remove_probe(&self, port: PortId, probe: ProbeId) {
        let removed = lock(&self.registry).probes.remove(&probe);
        if let (Ok(pad), Some((_, probe))) = (self.pad(port), removed) {
            pad.remove_probe(probe);
        }
    }

    fn set_state(&self, stage: StageId, state: StageState) -> Result<(), MediaError> {
        self.element(stage)?
            .set_state(to_gst_state(state))
            .map(|_| ())
            .map_err(|e| backend_error("state change failed", e))
    }

    fn state(&self, stage: StageId) -> Option<StageState> {
        match self.element(stage).ok()?.current_state() {
            gst::State::Playing => Some(StageState::Running),
            gst::State::Paused => Some(StageState::Ready),
            _ => Some(StageState::Idle),
        }
    }

    fn set_locked_state(&self, stage: StageId, locked: bool) {
        if let Ok(element) = self.element(stage) {
            element.set_locked_state(locked);
        }
    }

    fn sync_state_with_parent(&self, stage: StageId) -> Result<(), MediaError> {
        self.element(stage)?
            .sync_state_with_parent()
            .map_err(|e| backend_error("cannot sync state", e))
    }

    fn use_shared_clock(&self, graph: StageId) -> Result<(), MediaError> {
        let pipeline = self
            .element(graph)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| MediaError::InvalidArgument(format!("{:?} is not top-level", graph)))?;
        pipeline.use_clock(Some(&gst::SystemClock::obtain()));
        pipeline.set_start_time(gst::ClockTime::NONE);
        pipeline.set_base_time(gst::ClockTime::ZERO);
        Ok(())
    }

    fn pair_relay(&self, ingress: StageId, egress: StageId) -> Result<(), MediaError> {
        let (ingress, egress) = (self.element(ingress)?, self.element(egress)?);
        if Self::factory_name(&ingress) != "proxysrc" || Self::factory_name(&egress) != "proxysink"
        {
            return Err(MediaError::InvalidArgument(
                "relay needs a proxysrc and a proxysink".to_owned(),
            ));
        }
        ingress.set_property("proxysink", &egress);
        Ok(())
    }

    fn send_end_of_stream(&self, port: PortId) -> Result<(), MediaError> {
        let pad = self.pad(port)?;
        if !pad.send_event(gst::event::Eos::new()) {
            return Err(MediaError::Backend(format!(
                "{} refused end-of-stream",
                pad.name()
            )));
        }
        Ok(())
    }

    fn connect_new_output_port(
        &self,
        stage: StageId,
        callback: PortCallback,
    ) -> Result<(), MediaError> {
        let element = self.element(stage)?;
        let registry = self.registry.clone();
        element.connect_pad_added(move |_, pad| {
            if pad.direction() != gst::PadDirection::Src {
                return;
            }
            let port = lock(&registry).port_of(pad);
            callback(port);
        });
        Ok(())
    }

    fn connect_end_of_stream(
        &self,
        graph: StageId,
        callback: NotifyCallback,
    ) -> Result<(), MediaError> {
        self.element(graph)?;
        lock(&self.registry)
            .eos_callbacks
            .entry(graph)
            .or_default()
            .push(Arc::new(callback));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediamux_traits::{AudioWave, VideoPattern};

    fn backend() -> Arc<dyn GraphBackend> {
        GStreamerBackend::init().unwrap()
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(to_gst_state(StageState::Idle), gst::State::Ready);
        assert_eq!(to_gst_state(StageState::Running), gst::State::Playing);
    }

    #[test]
    fn test_tee_branches_and_probes() {
        let backend = backend();
        let graph = backend.create_graph("test").unwrap();
        let source = backend
            .create_stage(
                graph,
                &StageKind::Source(SourceSpec::TestAudio {
                    wave: AudioWave::Silence,
                }),
                "source",
            )
            .unwrap();
        let tee = backend.create_stage(graph, &StageKind::FanOut, "tee").unwrap();
        let queue = backend
            .create_stage(graph, &StageKind::Buffer(Default::default()), "queue")
            .unwrap();

        let upstream = backend.static_port(source, PortDirection::Src).unwrap();
        let tee_sink = backend.static_port(tee, PortDirection::Sink).unwrap();
        backend.link(upstream, tee_sink).unwrap();

        let branch = backend.request_port(tee).unwrap();
        let queue_sink = backend.static_port(queue, PortDirection::Sink).unwrap();
        backend.link(branch, queue_sink).unwrap();
        assert_eq!(backend.peer(queue_sink), Some(branch));
        assert_eq!(backend.port_owner(branch), Some(tee));

        let probe = backend.install_flow_block_probe(branch).unwrap();
        backend.unlink(branch, queue_sink).unwrap();
        backend.remove_probe(branch, probe);
        backend.release_port(tee, branch).unwrap();
        assert_eq!(backend.peer(queue_sink), None);

        backend.remove_stage(graph).unwrap();
        assert_eq!(backend.stage_name(tee), None);
    }

    #[test]
    fn test_released_ports_drop_their_probes() {
        gst::init().unwrap();
        let backend = GStreamerBackend::default();
        let graph = backend.create_graph("probes").unwrap();
        let tee = backend.create_stage(graph, &StageKind::FanOut, "tee").unwrap();

        let released = backend.request_port(tee).unwrap();
        backend.install_flow_block_probe(released).unwrap();
        backend.release_port(tee, released).unwrap();
        assert!(lock(&backend.registry).probes.is_empty());

        let kept = backend.request_port(tee).unwrap();
        backend.install_flow_block_probe(kept).unwrap();
        assert_eq!(lock(&backend.registry).probes.len(), 1);
        backend.remove_stage(graph).unwrap();
        assert!(lock(&backend.registry).probes.is_empty());
    }

    #[test]
    fn test_relay_pairing_checks_kinds() {
        let backend = backend();
        let producer = backend.create_graph("producer").unwrap();
        let consumer = backend.create_graph("consumer").unwrap();
        let egress = backend
            .create_stage(producer, &StageKind::RelayEgress, "egress")
            .unwrap();
        let ingress = backend
            .create_stage(consumer, &StageKind::RelayIngress, "ingress")
            .unwrap();
        assert!(backend.pair_relay(egress, ingress).is_err());
        backend.pair_relay(ingress, egress).unwrap();
        backend.use_shared_clock(consumer).unwrap();
        assert!(backend.use_shared_clock(ingress).is_err());
    }

    #[test]
    fn test_video_render_exposes_sink() {
        let backend = backend();
        let graph = backend.create_graph("render").unwrap();
        let pattern = VideoPattern::Black;
        let source = backend
            .create_stage(
                graph,
                &StageKind::Source(SourceSpec::TestVideo { pattern }),
                "source",
            )
            .unwrap();
        // Rendering may be unavailable on headless machines.
        if let Ok(render) =
            backend.create_stage(graph, &StageKind::Render(MediaKind::Video), "render")
        {
            let sink = backend.static_port(render, PortDirection::Sink).unwrap();
            let src = backend.static_port(source, PortDirection::Src).unwrap();
            backend.link(src, sink).unwrap();
            assert_eq!(backend.port_owner(sink), Some(render));
        }
    }
}
