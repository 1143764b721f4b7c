/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! An in-memory backend. It keeps the graph topology, port links, probes
//! and stage states, and can push simulated buffers through the graph so
//! that delivery can be observed without a real media engine.

use log::debug;
use mediamux_traits::{
    BackendInit, GraphBackend, MediaError, NotifyCallback, PortCallback, PortDirection, PortId,
    ProbeId, StageId, StageKind, StageState,
};
use std::collections::HashMap;
use std::mem::{self, Discriminant};
use std::sync::{Arc, Mutex, MutexGuard};

struct Stage {
    name: String,
    /// `None` for top-level graphs.
    kind: Option<StageKind>,
    parent: Option<StageId>,
    state: StageState,
    locked: bool,
    shared_clock: bool,
    /// For ingress adapters, the egress they read from.
    relay: Option<StageId>,
    rendered: usize,
    eos: usize,
    new_port_callbacks: Vec<Arc<PortCallback>>,
    eos_callbacks: Vec<Arc<NotifyCallback>>,
}

struct Port {
    owner: StageId,
    direction: PortDirection,
    requested: bool,
    peer: Option<PortId>,
    probes: Vec<ProbeId>,
}

#[derive(Default)]
struct Graph {
    next_id: u64,
    stages: HashMap<StageId, Stage>,
    ports: HashMap<PortId, Port>,
    link_failures: usize,
    unavailable: Vec<Discriminant<StageKind>>,
}

impl Graph {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_stage(&mut self, name: &str, kind: Option<StageKind>, parent: Option<StageId>) -> StageId {
        let id = StageId(self.next_id());
        self.stages.insert(
            id,
            Stage {
                name: name.to_owned(),
                kind,
                parent,
                state: StageState::Idle,
                locked: false,
                shared_clock: false,
                relay: None,
                rendered: 0,
                eos: 0,
                new_port_callbacks: vec![],
                eos_callbacks: vec![],
            },
        );
        id
    }

    fn add_port(&mut self, owner: StageId, direction: PortDirection, requested: bool) -> PortId {
        let id = PortId(self.next_id());
        self.ports.insert(
            id,
            Port {
                owner,
                direction,
                requested,
                peer: None,
                probes: vec![],
            },
        );
        id
    }

    fn stage(&self, id: StageId) -> Result<&Stage, MediaError> {
        self.stages
            .get(&id)
            .ok_or_else(|| MediaError::InvalidArgument(format!("unknown stage {:?}", id)))
    }

    fn stage_mut(&mut self, id: StageId) -> Result<&mut Stage, MediaError> {
        self.stages
            .get_mut(&id)
            .ok_or_else(|| MediaError::InvalidArgument(format!("unknown stage {:?}", id)))
    }

    fn port(&self, id: PortId) -> Result<&Port, MediaError> {
        self.ports
            .get(&id)
            .ok_or_else(|| MediaError::InvalidArgument(format!("unknown port {:?}", id)))
    }

    fn ports_of(&self, stage: StageId, direction: PortDirection) -> Vec<PortId> {
        let mut ports: Vec<PortId> = self
            .ports
            .iter()
            .filter(|(_, p)| p.owner == stage && p.direction == direction)
            .map(|(id, _)| *id)
            .collect();
        ports.sort();
        ports
    }

    fn children(&self, stage: StageId) -> Vec<StageId> {
        let mut children: Vec<StageId> = self
            .stages
            .iter()
            .filter(|(_, s)| s.parent == Some(stage))
            .map(|(id, _)| *id)
            .collect();
        children.sort();
        children
    }

    fn top_level(&self, mut stage: StageId) -> StageId {
        while let Some(parent) = self.stages.get(&stage).and_then(|s| s.parent) {
            stage = parent;
        }
        stage
    }

    /// A stage processes data only if it and all of its ancestors are running.
    fn is_running(&self, stage: StageId) -> bool {
        let mut current = Some(stage);
        while let Some(id) = current {
            match self.stages.get(&id) {
                Some(s) if s.state == StageState::Running => current = s.parent,
                _ => return false,
            }
        }
        true
    }

    fn set_state_recursive(&mut self, stage: StageId, state: StageState) {
        if let Some(s) = self.stages.get_mut(&stage) {
            s.state = state;
        }
        for child in self.children(stage) {
            if !self.stages[&child].locked {
                self.set_state_recursive(child, state);
            }
        }
    }

    fn drop_port(&mut self, port: PortId) {
        if let Some(removed) = self.ports.remove(&port) {
            if let Some(peer) = removed.peer {
                if let Some(peer) = self.ports.get_mut(&peer) {
                    peer.peer = None;
                }
            }
        }
    }

    fn drop_stage(&mut self, stage: StageId) {
        for child in self.children(stage) {
            self.drop_stage(child);
        }
        let ports: Vec<PortId> = self
            .ports
            .iter()
            .filter(|(_, p)| p.owner == stage)
            .map(|(id, _)| *id)
            .collect();
        for port in ports {
            self.drop_port(port);
        }
        for other in self.stages.values_mut() {
            if other.relay == Some(stage) {
                other.relay = None;
            }
        }
        self.stages.remove(&stage);
    }

    /// Pushes one buffer out of `src` and returns how many render stages got it.
    fn deliver(&mut self, src: PortId) -> usize {
        let sink = match self.ports.get(&src) {
            Some(port) if port.probes.is_empty() => match port.peer {
                Some(sink) => sink,
                None => return 0,
            },
            _ => return 0,
        };
        let owner = match self.ports.get(&sink) {
            Some(port) if port.probes.is_empty() => port.owner,
            _ => return 0,
        };
        if !self.is_running(owner) {
            return 0;
        }
        let kind = self.stages[&owner].kind;
        match kind {
            Some(StageKind::Render(_)) => {
                if let Some(stage) = self.stages.get_mut(&owner) {
                    stage.rendered += 1;
                }
                1
            },
            Some(StageKind::RelayEgress) => {
                let mut ingresses: Vec<StageId> = self
                    .stages
                    .iter()
                    .filter(|(_, s)| s.relay == Some(owner))
                    .map(|(id, _)| *id)
                    .collect();
                ingresses.sort();
                let mut delivered = 0;
                for ingress in ingresses {
                    if !self.is_running(ingress) {
                        continue;
                    }
                    for port in self.ports_of(ingress, PortDirection::Src) {
                        delivered += self.deliver(port);
                    }
                }
                delivered
            },
            _ => {
                let mut delivered = 0;
                for port in self.ports_of(owner, PortDirection::Src) {
                    delivered += self.deliver(port);
                }
                delivered
            },
        }
    }
}

#[derive(Default)]
pub struct DummyBackend {
    graph: Mutex<Graph>,
}

impl BackendInit for DummyBackend {
    fn init() -> Result<Arc<dyn GraphBackend>, MediaError> {
        Ok(Arc::new(DummyBackend::new()))
    }
}

impl DummyBackend {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<Graph> {
        match self.graph.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes the next `count` link attempts fail as incompatible.
    pub fn fail_next_links(&self, count: usize) {
        self.lock().link_failures = count;
    }

    /// Makes every later attempt to create a stage of this kind fail.
    pub fn fail_stage_creation(&self, kind: &StageKind) {
        self.lock().unavailable.push(mem::discriminant(kind));
    }

    pub fn clear_failures(&self) {
        let mut graph = self.lock();
        graph.link_failures = 0;
        graph.unavailable.clear();
    }

    pub fn stage_exists(&self, stage: StageId) -> bool {
        self.lock().stages.contains_key(&stage)
    }

    pub fn stage_count(&self) -> usize {
        self.lock().stages.len()
    }

    pub fn find_stage(&self, name: &str) -> Option<StageId> {
        self.lock()
            .stages
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(id, _)| *id)
    }

    pub fn stages_of_kind<F: Fn(&StageKind) -> bool>(&self, filter: F) -> Vec<StageId> {
        let graph = self.lock();
        let mut stages: Vec<StageId> = graph
            .stages
            .iter()
            .filter(|(_, s)| s.kind.as_ref().map_or(false, |k| filter(k)))
            .map(|(id, _)| *id)
            .collect();
        stages.sort();
        stages
    }

    pub fn parent(&self, stage: StageId) -> Option<StageId> {
        self.lock().stages.get(&stage).and_then(|s| s.parent)
    }

    pub fn is_locked(&self, stage: StageId) -> bool {
        self.lock().stages.get(&stage).map_or(false, |s| s.locked)
    }

    pub fn uses_shared_clock(&self, graph: StageId) -> bool {
        self.lock().stages.get(&graph).map_or(false, |s| s.shared_clock)
    }

    pub fn relay_of(&self, ingress: StageId) -> Option<StageId> {
        self.lock().stages.get(&ingress).and_then(|s| s.relay)
    }

    /// Number of currently requested (not yet released) ports on a stage.
    pub fn requested_ports(&self, stage: StageId) -> usize {
        self.lock()
            .ports
            .values()
            .filter(|p| p.owner == stage && p.requested)
            .count()
    }

    pub fn src_ports(&self, stage: StageId) -> Vec<PortId> {
        self.lock().ports_of(stage, PortDirection::Src)
    }

    pub fn probe_count(&self, port: PortId) -> usize {
        self.lock().ports.get(&port).map_or(0, |p| p.probes.len())
    }

    /// Number of buffers a render stage has received.
    pub fn rendered(&self, stage: StageId) -> usize {
        self.lock().stages.get(&stage).map_or(0, |s| s.rendered)
    }

    /// Number of end-of-stream markers sent into ports of a stage.
    pub fn eos_count(&self, stage: StageId) -> usize {
        self.lock().stages.get(&stage).map_or(0, |s| s.eos)
    }

    /// Pushes one buffer out of a running source stage.
    /// Returns how many render stages received it.
    pub fn push_buffer(&self, source: StageId) -> usize {
        let mut graph = self.lock();
        match graph.stages.get(&source) {
            Some(stage) if matches!(stage.kind, Some(StageKind::Source(_))) => {},
            _ => return 0,
        }
        if !graph.is_running(source) {
            return 0;
        }
        let mut delivered = 0;
        for port in graph.ports_of(source, PortDirection::Src) {
            delivered += graph.deliver(port);
        }
        delivered
    }

    /// Simulates a decode stage finding its output once data flows.
    /// Callbacks run on the calling thread, like a streaming thread would.
    pub fn discover_output_port(&self, stage: StageId) -> Result<PortId, MediaError> {
        let (port, callbacks) = {
            let mut graph = self.lock();
            let kind = graph.stage(stage)?.kind;
            match kind {
                Some(StageKind::Decode) => {},
                _ => {
                    return Err(MediaError::InvalidArgument(
                        "only decode stages discover outputs".to_owned(),
                    ))
                },
            }
            let port = graph.add_port(stage, PortDirection::Src, false);
            (port, graph.stage(stage)?.new_port_callbacks.clone())
        };
        for callback in callbacks {
            callback(port);
        }
        Ok(port)
    }
}

impl GraphBackend for DummyBackend {
    fn create_graph(&self, name: &str) -> Result<StageId, MediaError> {
        Ok(self.lock().add_stage(name, None, None))
    }

    fn create_stage(
        &self,
        graph: StageId,
        kind: &StageKind,
        name: &str,
    ) -> Result<StageId, MediaError> {
        let mut g = self.lock();
        g.stage(graph)?;
        if g.unavailable.contains(&mem::discriminant(kind)) {
            return Err(MediaError::Unavailable(format!(
                "no element for {:?} ({})",
                kind, name
            )));
        }
        let stage = g.add_stage(name, Some(*kind), Some(graph));
        match *kind {
            StageKind::FanOut | StageKind::Decode | StageKind::Render(_) | StageKind::RelayEgress => {
                g.add_port(stage, PortDirection::Sink, false);
            },
            StageKind::Buffer(_) => {
                g.add_port(stage, PortDirection::Sink, false);
                g.add_port(stage, PortDirection::Src, false);
            },
            StageKind::Source(_) | StageKind::RelayIngress => {
                g.add_port(stage, PortDirection::Src, false);
            },
        }
        debug!("Created {} ({:?}) as {:?}", name, kind, stage);
        Ok(stage)
    }

    fn remove_stage(&self, stage: StageId) -> Result<(), MediaError> {
        let mut graph = self.lock();
        graph.stage(stage)?;
        graph.drop_stage(stage);
        Ok(())
    }

    fn stage_name(&self, stage: StageId) -> Option<String> {
        self.lock().stages.get(&stage).map(|s| s.name.clone())
    }

    fn static_port(
        &self,
        stage: StageId,
        direction: PortDirection,
    ) -> Result<PortId, MediaError> {
        let graph = self.lock();
        let name = graph.stage(stage)?.name.clone();
        graph
            .ports
            .iter()
            .filter(|(_, p)| p.owner == stage && p.direction == direction && !p.requested)
            .map(|(id, _)| *id)
            .min()
            .ok_or_else(|| {
                MediaError::InvalidArgument(format!("{} has no {:?} port", name, direction))
            })
    }

    fn request_port(&self, stage: StageId) -> Result<PortId, MediaError> {
        let mut graph = self.lock();
        let kind = graph.stage(stage)?.kind;
        match kind {
            Some(StageKind::FanOut) => Ok(graph.add_port(stage, PortDirection::Src, true)),
            _ => Err(MediaError::InvalidArgument(format!(
                "{} has no request ports",
                graph.stage(stage)?.name
            ))),
        }
    }

    fn release_port(&self, stage: StageId, port: PortId) -> Result<(), MediaError> {
        let mut graph = self.lock();
        match graph.port(port) {
            Ok(p) if p.owner == stage && p.requested => {},
            _ => {
                return Err(MediaError::InvalidArgument(format!(
                    "{:?} is not a request port of {:?}",
                    port, stage
                )))
            },
        }
        graph.drop_port(port);
        Ok(())
    }

    fn port_owner(&self, port: PortId) -> Option<StageId> {
        self.lock().ports.get(&port).map(|p| p.owner)
    }

    fn peer(&self, port: PortId) -> Option<PortId> {
        self.lock().ports.get(&port).and_then(|p| p.peer)
    }

    fn link(&self, src: PortId, sink: PortId) -> Result<(), MediaError> {
        let mut graph = self.lock();
        let (src_port, sink_port) = (graph.port(src)?, graph.port(sink)?);
        if src_port.direction != PortDirection::Src || sink_port.direction != PortDirection::Sink
        {
            return Err(MediaError::Incompatible("wrong direction".to_owned()));
        }
        if src_port.peer.is_some() || sink_port.peer.is_some() {
            return Err(MediaError::Incompatible("was linked".to_owned()));
        }
        if graph.link_failures > 0 {
            graph.link_failures -= 1;
            return Err(MediaError::Incompatible("no common format".to_owned()));
        }
        if let Some(p) = graph.ports.get_mut(&src) {
            p.peer = Some(sink);
        }
        if let Some(p) = graph.ports.get_mut(&sink) {
            p.peer = Some(src);
        }
        Ok(())
    }

    fn unlink(&self, src: PortId, sink: PortId) -> Result<(), MediaError> {
        let mut graph = self.lock();
        if graph.port(src)?.peer != Some(sink) {
            return Err(MediaError::Backend(format!(
                "{:?} is not linked to {:?}",
                src, sink
            )));
        }
        if let Some(p) = graph.ports.get_mut(&src) {
            p.peer = None;
        }
        if let Some(p) = graph.ports.get_mut(&sink) {
            p.peer = None;
        }
        Ok(())
    }

    fn install_flow_block_probe(&self, port: PortId) -> Result<ProbeId, MediaError> {
        let mut graph = self.lock();
        graph.port(port)?;
        let probe = ProbeId(graph.next_id());
        if let Some(p) = graph.ports.get_mut(&port) {
            p.probes.push(probe);
        }
        Ok(probe)
    }

    fn remove_probe(&self, port: PortId, probe: ProbeId) {
        if let Some(p) = self.lock().ports.get_mut(&port) {
            p.probes.retain(|id| *id != probe);
        }
    }

    fn set_state(&self, stage: StageId, state: StageState) -> Result<(), MediaError> {
        let mut graph = self.lock();
        graph.stage(stage)?;
        graph.set_state_recursive(stage, state);
        Ok(())
    }

    fn state(&self, stage: StageId) -> Option<StageState> {
        self.lock().stages.get(&stage).map(|s| s.state)
    }

    fn set_locked_state(&self, stage: StageId, locked: bool) {
        if let Some(s) = self.lock().stages.get_mut(&stage) {
            s.locked = locked;
        }
    }

    fn sync_state_with_parent(&self, stage: StageId) -> Result<(), MediaError> {
        let mut graph = self.lock();
        let parent = graph.stage(stage)?.parent;
        if let Some(parent) = parent {
            let state = graph.stage(parent)?.state;
            graph.set_state_recursive(stage, state);
        }
        Ok(())
    }

    fn use_shared_clock(&self, graph: StageId) -> Result<(), MediaError> {
        let mut g = self.lock();
        let stage = g.stage_mut(graph)?;
        if stage.parent.is_some() {
            return Err(MediaError::InvalidArgument(format!(
                "{} is not a top-level graph",
                stage.name
            )));
        }
        stage.shared_clock = true;
        Ok(())
    }

    fn pair_relay(&self, ingress: StageId, egress: StageId) -> Result<(), MediaError> {
        let mut graph = self.lock();
        let kinds = (graph.stage(ingress)?.kind, graph.stage(egress)?.kind);
        match kinds {
            (Some(StageKind::RelayIngress), Some(StageKind::RelayEgress)) => {},
            _ => {
                return Err(MediaError::InvalidArgument(
                    "relay needs an ingress and an egress".to_owned(),
                ))
            },
        }
        graph.stage_mut(ingress)?.relay = Some(egress);
        Ok(())
    }

    fn send_end_of_stream(&self, port: PortId) -> Result<(), MediaError> {
        let callbacks = {
            let mut graph = self.lock();
            let owner = graph.port(port)?.owner;
            graph.stage_mut(owner)?.eos += 1;
            // Only a running graph can carry the marker to its sinks.
            if !graph.is_running(owner) {
                return Ok(());
            }
            let top = graph.top_level(owner);
            graph.stage(top)?.eos_callbacks.clone()
        };
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    fn connect_new_output_port(
        &self,
        stage: StageId,
        callback: PortCallback,
    ) -> Result<(), MediaError> {
        let mut graph = self.lock();
        let s = graph.stage_mut(stage)?;
        match s.kind {
            Some(StageKind::Decode) => {
                s.new_port_callbacks.push(Arc::new(callback));
                Ok(())
            },
            _ => Err(MediaError::InvalidArgument(format!(
                "{} never exposes new ports",
                s.name
            ))),
        }
    }

    fn connect_end_of_stream(
        &self,
        graph: StageId,
        callback: NotifyCallback,
    ) -> Result<(), MediaError> {
        let mut g = self.lock();
        g.stage_mut(graph)?.eos_callbacks.push(Arc::new(callback));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediamux_traits::{AudioWave, MediaKind, SourceSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source() -> StageKind {
        StageKind::Source(SourceSpec::TestAudio {
            wave: AudioWave::Sine,
        })
    }

    #[test]
    fn test_link_and_deliver() {
        let backend = DummyBackend::new();
        let graph = backend.create_graph("main").unwrap();
        let src = backend.create_stage(graph, &source(), "src").unwrap();
        let render = backend
            .create_stage(graph, &StageKind::Render(MediaKind::Audio), "render")
            .unwrap();
        let src_port = backend.static_port(src, PortDirection::Src).unwrap();
        let sink_port = backend.static_port(render, PortDirection::Sink).unwrap();
        backend.link(src_port, sink_port).unwrap();
        assert_eq!(backend.peer(sink_port), Some(src_port));

        assert_eq!(backend.push_buffer(src), 0);
        backend.set_state(graph, StageState::Running).unwrap();
        assert_eq!(backend.push_buffer(src), 1);

        let probe = backend.install_flow_block_probe(src_port).unwrap();
        assert_eq!(backend.push_buffer(src), 0);
        backend.remove_probe(src_port, probe);
        assert_eq!(backend.push_buffer(src), 1);
        assert_eq!(backend.rendered(render), 2);
    }

    #[test]
    fn test_locked_stage_keeps_state() {
        let backend = DummyBackend::new();
        let graph = backend.create_graph("main").unwrap();
        let src = backend.create_stage(graph, &source(), "src").unwrap();
        backend.set_locked_state(src, true);
        backend.set_state(graph, StageState::Running).unwrap();
        assert_eq!(backend.state(src), Some(StageState::Idle));
        assert_eq!(backend.state(graph), Some(StageState::Running));
    }

    #[test]
    fn test_link_rejections() {
        let backend = DummyBackend::new();
        let graph = backend.create_graph("main").unwrap();
        let tee = backend.create_stage(graph, &StageKind::FanOut, "tee").unwrap();
        let render = backend
            .create_stage(graph, &StageKind::Render(MediaKind::Video), "render")
            .unwrap();
        let sink = backend.static_port(render, PortDirection::Sink).unwrap();
        let pad = backend.request_port(tee).unwrap();

        backend.fail_next_links(1);
        assert!(matches!(
            backend.link(pad, sink),
            Err(MediaError::Incompatible(_))
        ));
        backend.link(pad, sink).unwrap();

        let other = backend.request_port(tee).unwrap();
        assert!(matches!(
            backend.link(other, sink),
            Err(MediaError::Incompatible(_))
        ));
        assert_eq!(backend.requested_ports(tee), 2);
        backend.release_port(tee, other).unwrap();
        assert_eq!(backend.requested_ports(tee), 1);
    }

    #[test]
    fn test_remove_graph_removes_children() {
        let backend = DummyBackend::new();
        let graph = backend.create_graph("main").unwrap();
        let egress = backend
            .create_stage(graph, &StageKind::RelayEgress, "egress")
            .unwrap();
        let other = backend.create_graph("other").unwrap();
        let ingress = backend
            .create_stage(other, &StageKind::RelayIngress, "ingress")
            .unwrap();
        backend.pair_relay(ingress, egress).unwrap();
        assert_eq!(backend.relay_of(ingress), Some(egress));

        backend.remove_stage(graph).unwrap();
        assert!(!backend.stage_exists(egress));
        assert_eq!(backend.relay_of(ingress), None);
        assert_eq!(backend.stage_count(), 2);
    }

    #[test]
    fn test_unavailable_stage() {
        let backend = DummyBackend::new();
        let graph = backend.create_graph("main").unwrap();
        backend.fail_stage_creation(&StageKind::Decode);
        assert!(matches!(
            backend.create_stage(graph, &StageKind::Decode, "decode"),
            Err(MediaError::Unavailable(_))
        ));
        assert_eq!(backend.stage_count(), 1);
    }

    #[test]
    fn test_discover_output_port_runs_callbacks() {
        let backend = DummyBackend::new();
        let graph = backend.create_graph("main").unwrap();
        let decode = backend
            .create_stage(graph, &StageKind::Decode, "decode")
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        backend
            .connect_new_output_port(
                decode,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let port = backend.discover_output_port(decode).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.port_owner(port), Some(decode));
    }
}
