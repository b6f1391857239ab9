//! Message set and codec for the motor-controller firmware nodes.
//!
//! Payloads use big-endian fixed-width fields; every non-empty payload is
//! terminated by a CRC-16 over the preceding bytes, low byte first.

pub mod codec;
pub mod messages;
pub mod status;

pub use codec::{DecodeError, crc16, current_to_fixed, fixed_to_current, mm_to_um, um_to_mm};
pub use messages::{
    Acknowledgement, LinearMoveRequest, Message, MessageId, MotorPositionResponse, MoveCompleted,
    TipActionRequest, TipActionResponse, ToolsDetectedNotification, WriteMotorCurrentRequest,
};
pub use status::{
    ErrorCode, MotorPositionStatus, MoveAck, PositionFlags, StopCondition, TipAction, ToolType,
};
