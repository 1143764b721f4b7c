//! Relay adapters that carry the branches of a fan-out into sub-graphs
//! with their own lifecycle.
//!
//! Each output is the egress half of a relay pair living next to the
//! fan-out. The consumer puts an ingress adapter into its own sub-graph
//! and pairs it with the returned [`RelayOutput`].

use crate::tee::TeeMultiplexer;
use log::{debug, error, warn};
use mediamux_traits::{GraphBackend, MediaError, PortDirection, PortId, StageId, StageKind};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// Handle to one output of a [`ProxyMultiplexer`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RelayOutput {
    egress: StageId,
}

impl RelayOutput {
    /// The egress adapter an ingress adapter should be paired with.
    pub fn egress(&self) -> StageId {
        self.egress
    }
}

pub struct ProxyMultiplexer {
    backend: Arc<dyn GraphBackend>,
    graph: StageId,
    prefix: String,
    tee: TeeMultiplexer,
    outputs: RefCell<Vec<(RelayOutput, PortId)>>,
    // Never reused, removed adapters keep their number.
    counter: Cell<u64>,
}

impl ProxyMultiplexer {
    pub fn new(
        backend: &Arc<dyn GraphBackend>,
        graph: StageId,
        upstream: PortId,
        prefix: &str,
    ) -> Result<ProxyMultiplexer, MediaError> {
        let tee = TeeMultiplexer::new(backend, graph, upstream, &format!("{}_tee", prefix))?;
        Ok(ProxyMultiplexer {
            backend: backend.clone(),
            graph,
            prefix: prefix.to_owned(),
            tee,
            outputs: RefCell::new(vec![]),
            counter: Cell::new(0),
        })
    }

    pub fn add_output(&self) -> Result<RelayOutput, MediaError> {
        let n = self.counter.get();
        self.counter.set(n + 1);
        let name = format!("{}_proxySink{}", self.prefix, n);

        let egress = self
            .backend
            .create_stage(self.graph, &StageKind::RelayEgress, &name)?;
        let sink = match self.plug(egress) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = self.backend.remove_stage(egress);
                return Err(e);
            },
        };

        let output = RelayOutput { egress };
        self.outputs.borrow_mut().push((output, sink));
        debug!("{}: added {}", self.prefix, name);
        Ok(output)
    }

    fn plug(&self, egress: StageId) -> Result<PortId, MediaError> {
        self.backend.sync_state_with_parent(egress)?;
        let sink = self.backend.static_port(egress, PortDirection::Sink)?;
        self.tee.add_branch(sink)?;
        Ok(sink)
    }

    pub fn remove_output(&self, output: RelayOutput) -> Result<(), MediaError> {
        let index = self
            .outputs
            .borrow()
            .iter()
            .position(|(o, _)| *o == output);
        let index = match index {
            Some(index) => index,
            None => {
                error!("{}: {:?} was not produced here", self.prefix, output);
                return Err(MediaError::InvalidArgument(format!(
                    "{:?} is not an output of {}",
                    output, self.prefix
                )));
            },
        };

        let (_, sink) = self.outputs.borrow_mut().remove(index);
        match self.tee.remove_branch(sink) {
            Ok(()) | Err(MediaError::NotAConsumer) => {},
            Err(e) => {
                self.outputs.borrow_mut().insert(index, (output, sink));
                return Err(e);
            },
        }
        // The branch is gone, so the output counts as removed either way.
        if let Err(e) = self.backend.remove_stage(output.egress) {
            warn!("{}: cannot remove {:?}: {}", self.prefix, output, e);
        }
        Ok(())
    }

    pub fn output_count(&self) -> usize {
        self.outputs.borrow().len()
    }

    pub fn tee(&self) -> &TeeMultiplexer {
        &self.tee
    }
}

impl Drop for ProxyMultiplexer {
    fn drop(&mut self) {
        for (output, _) in self.outputs.borrow_mut().drain(..) {
            if let Err(e) = self.backend.remove_stage(output.egress) {
                warn!("{}: cannot remove {:?}: {}", self.prefix, output, e);
            }
        }
    }
}
