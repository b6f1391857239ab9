use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use canbus::{BusTransport, NodeId};
use tokio::sync::Mutex;
use tracing::warn;

use crate::messenger::Messenger;
use crate::models::SharedState;
use crate::motor_position::get_motor_position;

/// Periodically refreshes the position snapshot for the configured nodes.
pub async fn run_state_monitor<B: BusTransport>(
    messenger: Arc<Messenger<B>>,
    shared_state: Arc<Mutex<SharedState>>,
    nodes: HashSet<NodeId>,
    period: Duration,
    timeout: Duration,
) -> Result<()> {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;

        match get_motor_position(&messenger, &nodes, timeout).await {
            Ok(positions) => {
                let mut shared_state = shared_state.lock().await;
                shared_state.positions = positions;
            }
            Err(e) => warn!("position refresh failed: {}", e),
        }
    }
}
