use log::{debug, warn};
use mediamux_traits::{GraphBackend, MediaError, PortId, QueueOptions, StageId, StageState};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct MediaContextOptions {
    /// Name of the graph hosting producers and tracks.
    pub graph_name: String,
    /// Buffering applied at the head of every track.
    pub queue: QueueOptions,
}

impl Default for MediaContextOptions {
    fn default() -> Self {
        MediaContextOptions {
            graph_name: "mediamux shared graph".to_owned(),
            queue: QueueOptions::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

/// Notifications raised by the backend from its own threads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngineEvent {
    /// A decode stage exposed a deliverable output.
    NewOutputPort(PortId),
    /// A sub-graph finished draining after an end-of-stream marker.
    EndOfStream,
}

/// Receives engine notifications on the control thread.
pub trait EngineListener {
    fn handle_engine_event(&self, event: EngineEvent);
}

/// The sending half handed to backend callbacks. It never touches the
/// listener itself; the event is queued until the next dispatch.
#[derive(Clone)]
pub struct Notifier {
    id: ListenerId,
    sender: Sender<(ListenerId, EngineEvent)>,
}

impl Notifier {
    pub fn notify(&self, event: EngineEvent) {
        let _ = self.sender.send((self.id, event));
    }
}

/// Owns the backend handle, the shared graph in which producers and
/// tracks live, and the queue of deferred engine notifications.
pub struct MediaContext {
    backend: Arc<dyn GraphBackend>,
    graph: StageId,
    options: MediaContextOptions,
    sender: Sender<(ListenerId, EngineEvent)>,
    receiver: Receiver<(ListenerId, EngineEvent)>,
    listeners: RefCell<HashMap<ListenerId, Weak<dyn EngineListener>>>,
    next_listener: Cell<u64>,
    name_counter: Cell<u64>,
}

impl MediaContext {
    pub fn new(
        backend: Arc<dyn GraphBackend>,
        options: MediaContextOptions,
    ) -> Result<Rc<MediaContext>, MediaError> {
        let graph = backend.create_graph(&options.graph_name)?;
        let started = backend
            .use_shared_clock(graph)
            .and_then(|_| backend.set_state(graph, StageState::Running));
        if let Err(e) = started {
            let _ = backend.remove_stage(graph);
            return Err(e);
        }

        let (sender, receiver) = channel();
        Ok(Rc::new(MediaContext {
            backend,
            graph,
            options,
            sender,
            receiver,
            listeners: RefCell::new(HashMap::new()),
            next_listener: Cell::new(0),
            name_counter: Cell::new(0),
        }))
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    pub fn graph(&self) -> StageId {
        self.graph
    }

    pub fn options(&self) -> &MediaContextOptions {
        &self.options
    }

    /// `prefix` followed by a number never handed out before by this context.
    pub fn unique_name(&self, prefix: &str) -> String {
        let n = self.name_counter.get();
        self.name_counter.set(n + 1);
        format!("{}{}", prefix, n)
    }

    pub fn register_listener(&self, listener: Weak<dyn EngineListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.listeners.borrow_mut().insert(id, listener);
        id
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.listeners.borrow_mut().remove(&id);
    }

    pub fn notifier(&self, id: ListenerId) -> Notifier {
        Notifier {
            id,
            sender: self.sender.clone(),
        }
    }

    /// Delivers every queued notification. Returns how many reached a listener.
    pub fn dispatch_pending(&self) -> usize {
        let mut handled = 0;
        while let Ok((id, event)) = self.receiver.try_recv() {
            if self.dispatch(id, event) {
                handled += 1;
            }
        }
        handled
    }

    /// Waits up to `timeout` for a notification, then drains the queue.
    pub fn dispatch_timeout(&self, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok((id, event)) => usize::from(self.dispatch(id, event)) + self.dispatch_pending(),
            Err(RecvTimeoutError::Timeout) => 0,
            // We hold a sender ourselves.
            Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn dispatch(&self, id: ListenerId, event: EngineEvent) -> bool {
        // Released before the call so listeners may (un)register.
        let listener = self.listeners.borrow().get(&id).and_then(|l| l.upgrade());
        match listener {
            Some(listener) => {
                listener.handle_engine_event(event);
                true
            },
            None => {
                debug!("Dropping {:?} for a listener that is gone", event);
                self.unregister_listener(id);
                false
            },
        }
    }
}

impl Drop for MediaContext {
    fn drop(&mut self) {
        if let Err(e) = self.backend.remove_stage(self.graph) {
            warn!("Cannot remove {}: {}", self.options.graph_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::setup;
    use std::thread;

    struct Recorder {
        events: RefCell<Vec<EngineEvent>>,
    }

    impl EngineListener for Recorder {
        fn handle_engine_event(&self, event: EngineEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    #[test]
    fn test_shared_graph_runs_on_shared_clock() {
        let (backend, context) = setup();
        assert_eq!(
            backend.state(context.graph()),
            Some(StageState::Running)
        );
        assert!(backend.uses_shared_clock(context.graph()));
        let graph = context.graph();
        drop(context);
        assert!(!backend.stage_exists(graph));
    }

    #[test]
    fn test_notifications_are_deferred_to_dispatch() {
        let (_backend, context) = setup();
        let recorder = Rc::new(Recorder {
            events: RefCell::new(vec![]),
        });
        let listener: Rc<dyn EngineListener> = recorder.clone();
        let weak = Rc::downgrade(&listener);
        let id = context.register_listener(weak);
        let notifier = context.notifier(id);

        thread::spawn(move || notifier.notify(EngineEvent::NewOutputPort(PortId(7))))
            .join()
            .unwrap();
        assert!(recorder.events.borrow().is_empty());

        assert_eq!(context.dispatch_pending(), 1);
        assert_eq!(
            *recorder.events.borrow(),
            vec![EngineEvent::NewOutputPort(PortId(7))]
        );
    }

    #[test]
    fn test_events_for_dropped_listeners_are_discarded() {
        let (_backend, context) = setup();
        let recorder = Rc::new(Recorder {
            events: RefCell::new(vec![]),
        });
        let listener: Rc<dyn EngineListener> = recorder.clone();
        let weak = Rc::downgrade(&listener);
        let notifier = context.notifier(context.register_listener(weak));
        drop(listener);
        drop(recorder);
        notifier.notify(EngineEvent::EndOfStream);
        assert_eq!(context.dispatch_pending(), 0);
    }

    #[test]
    fn test_dispatch_timeout_waits_for_the_transport() {
        let (_backend, context) = setup();
        let recorder = Rc::new(Recorder {
            events: RefCell::new(vec![]),
        });
        let listener: Rc<dyn EngineListener> = recorder.clone();
        let weak = Rc::downgrade(&listener);
        let notifier = context.notifier(context.register_listener(weak));
        assert_eq!(context.dispatch_timeout(Duration::from_millis(10)), 0);

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            notifier.notify(EngineEvent::EndOfStream);
        });
        assert_eq!(context.dispatch_timeout(Duration::from_secs(5)), 1);
        sender.join().unwrap();
        assert_eq!(*recorder.events.borrow(), vec![EngineEvent::EndOfStream]);
    }

    #[test]
    fn test_unique_names() {
        let (_backend, context) = setup();
        assert_eq!(context.unique_name("Output"), "Output0");
        assert_eq!(context.unique_name("Input"), "Input1");
    }
}
