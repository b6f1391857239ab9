use std::collections::HashMap;

use canbus::NodeId;
use firmware::{MotorPositionStatus, MoveAck, ToolType, ToolsDetectedNotification};

/// Logical attachment point for a tool, distinct from the node that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Carrier {
    Left,
    Right,
}

pub type ToolMap = HashMap<Carrier, ToolType>;

pub fn tool_map(notification: &ToolsDetectedNotification) -> ToolMap {
    HashMap::from([
        (Carrier::Left, notification.left),
        (Carrier::Right, notification.right),
    ])
}

/// Final per-node outcome of a move run, in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveStatus {
    pub position: f32,
    pub encoder_position: f32,
    pub ack: MoveAck,
}

/// hold and run current targets in amps, per node.
pub type CompleteCurrentSettings = HashMap<NodeId, (f32, f32)>;

/// A single current value in amps, per node.
pub type PartialCurrentSettings = HashMap<NodeId, f32>;

#[derive(Debug, Default)]
pub struct SharedState {
    pub positions: HashMap<NodeId, MotorPositionStatus>,
}
