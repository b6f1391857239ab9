use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canbus::transport::match_all;
use canbus::{ArbitrationId, BusSubscription, BusTransport, NodeId};
use firmware::{ErrorCode, Message, MessageId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::error::ControlError;

const LISTENER_QUEUE: usize = 32;

pub type MessageFilter = Box<dyn Fn(&ArbitrationId, &Message) -> bool + Send + Sync>;

struct ListenerEntry {
    filter: MessageFilter,
    tx: mpsc::Sender<(Message, ArbitrationId)>,
}

type ListenerTable = Arc<Mutex<HashMap<u64, ListenerEntry>>>;

/// Request/response engine over the bus. Owns the transport handle and the
/// table of active response listeners; the table is the only shared mutable
/// state and is only ever locked for short, non-awaiting sections.
pub struct Messenger<B: BusTransport> {
    bus: Arc<B>,
    own_node: NodeId,
    listeners: ListenerTable,
    next_listener: AtomicU64,
    dispatch: JoinHandle<()>,
}

impl<B: BusTransport> Messenger<B> {
    pub fn new(bus: Arc<B>, own_node: NodeId) -> Self {
        let listeners: ListenerTable = Arc::new(Mutex::new(HashMap::new()));
        let subscription = bus.subscribe(match_all());
        let dispatch = tokio::spawn(dispatch_loop(subscription, listeners.clone()));

        Self {
            bus,
            own_node,
            listeners,
            next_listener: AtomicU64::new(0),
            dispatch,
        }
    }

    pub fn own_node(&self) -> NodeId {
        self.own_node
    }

    /// Active listener count; the baseline must be restored after every
    /// request resolves.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Register a filtered listener. The returned guard deregisters itself
    /// on drop, so no exit path can leak an entry. Every listener whose
    /// filter matches sees the frame; two live listeners with identical
    /// filters would both observe the same responses, so callers must not
    /// issue overlapping-target requests concurrently.
    pub fn listen(&self, filter: MessageFilter) -> ResponseListener {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .insert(id, ListenerEntry { filter, tx });

        ResponseListener {
            id,
            rx,
            table: self.listeners.clone(),
        }
    }

    /// Encode and write one frame.
    pub async fn send(&self, target: NodeId, message: &Message) -> Result<(), ControlError> {
        let frame = message.to_frame(self.own_node, target);
        self.bus.send(frame).await?;
        Ok(())
    }

    /// Send, then await one `response_id` reply from every expected node.
    /// Never blocks past `timeout`; on expiry the error names the missing
    /// nodes and carries the subset that did answer. Duplicate replies from
    /// a node are ignored, the first one wins.
    pub async fn send_and_collect(
        &self,
        target: NodeId,
        message: &Message,
        expected: &HashSet<NodeId>,
        response_id: MessageId,
        timeout: Duration,
    ) -> Result<HashMap<NodeId, Message>, ControlError> {
        let own = self.own_node;
        let wanted = expected.clone();
        let mut listener = self.listen(Box::new(move |id, message| {
            message.message_id() == response_id
                && id.target == own
                && wanted.contains(&id.originating)
        }));

        self.send(target, message).await?;

        let deadline = Instant::now() + timeout;
        let mut collected: HashMap<NodeId, Message> = HashMap::new();

        while collected.len() < expected.len() {
            match timeout_at(deadline, listener.recv()).await {
                Ok(Some((message, id))) => {
                    collected.entry(id.originating).or_insert(message);
                }
                Ok(None) => return Err(ControlError::Transport(canbus::BusError::Closed)),
                Err(_) => {
                    let mut missing: Vec<NodeId> = expected
                        .iter()
                        .filter(|node| !collected.contains_key(node))
                        .copied()
                        .collect();
                    missing.sort();
                    return Err(ControlError::CommandTimedOut { missing, collected });
                }
            }
        }

        Ok(collected)
    }

    /// Fire-and-confirm: send, wait for an acknowledgement from each expected
    /// node, return the first non-ok error code encountered or `Ok`.
    pub async fn ensure_send(
        &self,
        target: NodeId,
        message: &Message,
        expected: &HashSet<NodeId>,
        timeout: Duration,
    ) -> Result<ErrorCode, ControlError> {
        let responses = self
            .send_and_collect(target, message, expected, MessageId::Acknowledgement, timeout)
            .await?;

        for (node, response) in &responses {
            if let Message::Acknowledgement(ack) = response {
                if ack.error_code != ErrorCode::Ok {
                    warn!("node {:?} acknowledged with {:?}", node, ack.error_code);
                    return Ok(ack.error_code);
                }
            }
        }

        Ok(ErrorCode::Ok)
    }
}

impl<B: BusTransport> Drop for Messenger<B> {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

/// Scoped listener guard handed out by [`Messenger::listen`].
pub struct ResponseListener {
    id: u64,
    rx: mpsc::Receiver<(Message, ArbitrationId)>,
    table: ListenerTable,
}

impl ResponseListener {
    pub async fn recv(&mut self) -> Option<(Message, ArbitrationId)> {
        self.rx.recv().await
    }
}

impl Drop for ResponseListener {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            table.remove(&self.id);
        }
    }
}

/// Decodes incoming frames and routes them to matching listeners. Malformed
/// frames are dropped with a debug log; they never take the loop down.
async fn dispatch_loop(mut subscription: BusSubscription, listeners: ListenerTable) {
    while let Some(frame) = subscription.recv().await {
        let (message, id) = match Message::from_frame(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("dropping undecodable frame 0x{:08x}: {}", frame.id.encode(), e);
                continue;
            }
        };

        let matching: Vec<mpsc::Sender<(Message, ArbitrationId)>> = {
            let table = listeners.lock().unwrap();
            table
                .values()
                .filter(|entry| (entry.filter)(&id, &message))
                .map(|entry| entry.tx.clone())
                .collect()
        };

        for tx in matching {
            if tx.try_send((message.clone(), id)).is_err() {
                warn!("listener queue full, dropping {:?}", message.message_id());
            }
        }
    }
}
