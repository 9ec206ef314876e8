use crossbeam_channel::{unbounded, Receiver, Sender};
use lazuli_core::id::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ToRun,
    ToComplete,
}

/// One dispatcher event: run a ready node, or apply a completion reported
/// by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub node_id: NodeId,
}

impl Event {
    pub fn to_run(node_id: NodeId) -> Self {
        Self {
            kind: EventKind::ToRun,
            node_id,
        }
    }

    pub fn to_complete(node_id: NodeId) -> Self {
        Self {
            kind: EventKind::ToComplete,
            node_id,
        }
    }
}

enum Message {
    Event(Event),
    Kill,
}

/// Result of a blocking `pop`.
#[derive(Debug, PartialEq, Eq)]
pub enum Popped {
    Event(Event),
    Killed,
}

/// MPSC queue feeding the dispatcher thread. Producers never block; `pop`
/// blocks until an event or the kill marker arrives. The kill marker is
/// delivered in-band, so events already queued ahead of it drain first.
pub struct DispatchQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, event: Event) {
        self.tx
            .send(Message::Event(event))
            .expect("dispatch queue closed");
    }

    pub fn signal_kill(&self) {
        self.tx.send(Message::Kill).expect("dispatch queue closed");
    }

    pub fn pop(&self) -> Popped {
        match self.rx.recv() {
            Ok(Message::Event(event)) => Popped::Event(event),
            Ok(Message::Kill) | Err(_) => Popped::Killed,
        }
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}
