//! Fan-out of one upstream port to any number of consumer ports.
//!
//! Branches are added and removed while data is flowing. Every mutation
//! of an existing link first installs a flow-blocking probe on the port
//! that is about to change, so a buffer in flight is dropped rather than
//! pushed towards a port that no longer has a peer.

use log::{debug, error, warn};
use mediamux_traits::{GraphBackend, MediaError, PortDirection, PortId, StageId, StageKind};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

struct Branch {
    consumer: PortId,
    fanout: PortId,
}

pub struct TeeMultiplexer {
    backend: Arc<dyn GraphBackend>,
    tee: StageId,
    name: String,
    sink: PortId,
    upstream: Cell<PortId>,
    branches: RefCell<Vec<Branch>>,
}

pub(crate) fn describe(backend: &Arc<dyn GraphBackend>, port: PortId) -> String {
    let owner = backend
        .port_owner(port)
        .and_then(|stage| backend.stage_name(stage))
        .unwrap_or_else(|| "<unowned>".to_owned());
    format!("{}/{}", owner, port.0)
}

impl TeeMultiplexer {
    /// Creates the fan-out stage inside `graph` and feeds it from `upstream`.
    pub fn new(
        backend: &Arc<dyn GraphBackend>,
        graph: StageId,
        upstream: PortId,
        name: &str,
    ) -> Result<TeeMultiplexer, MediaError> {
        let tee = backend.create_stage(graph, &StageKind::FanOut, name)?;
        let sink = match Self::plug(backend, tee, upstream) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = backend.remove_stage(tee);
                return Err(e);
            },
        };
        Ok(TeeMultiplexer {
            backend: backend.clone(),
            tee,
            name: name.to_owned(),
            sink,
            upstream: Cell::new(upstream),
            branches: RefCell::new(vec![]),
        })
    }

    fn plug(
        backend: &Arc<dyn GraphBackend>,
        tee: StageId,
        upstream: PortId,
    ) -> Result<PortId, MediaError> {
        backend.sync_state_with_parent(tee)?;
        let sink = backend.static_port(tee, PortDirection::Sink)?;
        backend.link(upstream, sink)?;
        Ok(sink)
    }

    pub fn stage(&self) -> StageId {
        self.tee
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upstream(&self) -> PortId {
        self.upstream.get()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.borrow().len()
    }

    pub fn has_branch(&self, consumer: PortId) -> bool {
        self.branches.borrow().iter().any(|b| b.consumer == consumer)
    }

    /// Links a freshly requested fan-out port to `consumer`.
    /// If the link is refused the port is released and no branch remains.
    pub fn add_branch(&self, consumer: PortId) -> Result<(), MediaError> {
        let fanout = self.backend.request_port(self.tee)?;

        if let Err(e) = self.backend.link(fanout, consumer) {
            error!(
                "Cannot add {} as {}'s peer: {}",
                describe(&self.backend, consumer),
                self.name,
                e
            );
            if let Err(e) = self.backend.release_port(self.tee, fanout) {
                warn!("{}: cannot release port {}: {}", self.name, fanout.0, e);
            }
            return Err(e);
        }

        self.branches.borrow_mut().push(Branch { consumer, fanout });
        Ok(())
    }

    /// Blocks, unlinks and releases the fan-out port feeding `consumer`.
    ///
    /// Returns `NotAConsumer` without touching anything if `consumer` is
    /// not currently fed by this fan-out.
    pub fn remove_branch(&self, consumer: PortId) -> Result<(), MediaError> {
        let fanout = match self.backend.peer(consumer) {
            Some(port) if self.backend.port_owner(port) == Some(self.tee) => port,
            _ => {
                warn!(
                    "{} is not {}'s peer",
                    describe(&self.backend, consumer),
                    self.name
                );
                return Err(MediaError::NotAConsumer);
            },
        };

        let probe = self.backend.install_flow_block_probe(fanout)?;
        if let Err(e) = self.backend.unlink(fanout, consumer) {
            error!(
                "{}: cannot unlink {}: {}",
                self.name,
                describe(&self.backend, consumer),
                e
            );
            self.backend.remove_probe(fanout, probe);
            return Err(e);
        }

        self.branches.borrow_mut().retain(|b| b.fanout != fanout);
        // The probe goes away with the port.
        if let Err(e) = self.backend.release_port(self.tee, fanout) {
            warn!("{}: cannot release port {}: {}", self.name, fanout.0, e);
        }
        Ok(())
    }

    /// Replaces the port feeding this fan-out without touching any branch.
    ///
    /// On failure the previous upstream is linked again before returning.
    pub fn change_upstream(&self, upstream: PortId) -> Result<(), MediaError> {
        let previous = self.upstream.get();
        if previous == upstream {
            return Ok(());
        }

        let probe = self.backend.install_flow_block_probe(previous)?;
        let result = self.relink(previous, upstream);
        self.backend.remove_probe(previous, probe);

        if result.is_ok() {
            self.upstream.set(upstream);
            debug!(
                "{}: upstream is now {}",
                self.name,
                describe(&self.backend, upstream)
            );
        }
        result
    }

    fn relink(&self, previous: PortId, upstream: PortId) -> Result<(), MediaError> {
        self.backend.unlink(previous, self.sink)?;
        if let Err(e) = self.backend.link(upstream, self.sink) {
            error!(
                "{}: cannot switch upstream to {}: {}",
                self.name,
                describe(&self.backend, upstream),
                e
            );
            if let Err(e) = self.backend.link(previous, self.sink) {
                error!("{}: lost its previous upstream: {}", self.name, e);
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for TeeMultiplexer {
    fn drop(&mut self) {
        if let Err(e) = self.backend.remove_stage(self.tee) {
            warn!("Cannot remove {}: {}", self.name, e);
        }
    }
}
