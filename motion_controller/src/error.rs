use std::collections::HashMap;

use canbus::NodeId;
use firmware::{Message, MoveAck};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("bus transport failure: {0}")]
    Transport(#[from] canbus::BusError),

    /// Raised with the explicit set of nodes that never answered; whatever
    /// was collected before the deadline rides along for callers that accept
    /// partial results.
    #[error("command timed out waiting for nodes {missing:?}")]
    CommandTimedOut {
        missing: Vec<NodeId>,
        collected: HashMap<NodeId, Message>,
    },

    #[error("node {node:?} reported an unsafe state: {reason}")]
    RoboticsControl { node: NodeId, reason: String },

    /// Every participating node's final ack for the failing step, not just
    /// the first failure.
    #[error("move group {group} failed: {acks:?}")]
    Motion {
        group: usize,
        acks: HashMap<NodeId, MoveAck>,
    },

    #[error("move run cancelled after group {last_completed_group:?}, outstanding nodes {outstanding:?}")]
    Cancelled {
        last_completed_group: Option<usize>,
        outstanding: Vec<NodeId>,
    },

    #[error("tool detection failed after {attempts} attempts")]
    ToolDetectionFailure { attempts: u32 },
}
