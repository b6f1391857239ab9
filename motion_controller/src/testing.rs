//! Scripted firmware nodes for the async tests.

use std::sync::Arc;

use canbus::{ArbitrationId, BusTransport, LoopbackBus, NodeId};
use firmware::Message;
use tokio::task::JoinHandle;

pub fn loopback() -> Arc<LoopbackBus> {
    Arc::new(LoopbackBus::new(256))
}

/// Answer every request with the same reply.
pub fn respond_with(
    reply: Message,
) -> impl Fn(&Message) -> Option<Message> + Send + Sync + 'static {
    move |_| Some(reply.clone())
}

/// Script a firmware node: every frame addressed to `node` (or broadcast)
/// is decoded and handed to `behavior`; a returned message goes back to the
/// requester.
pub fn spawn_responder<F>(bus: Arc<LoopbackBus>, node: NodeId, behavior: F) -> JoinHandle<()>
where
    F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
{
    let mut subscription = bus.subscribe(Arc::new(move |id: &ArbitrationId| {
        id.target == node || id.target == NodeId::Broadcast
    }));

    tokio::spawn(async move {
        while let Some(frame) = subscription.recv().await {
            let Ok((message, id)) = Message::from_frame(&frame) else {
                continue;
            };
            if let Some(reply) = behavior(&message) {
                let _ = bus.send(reply.to_frame(node, id.originating)).await;
            }
        }
    })
}
