use thiserror::Error;

pub mod arbitration;
pub mod frame;
pub mod gateway;
pub mod transport;

pub use arbitration::{ArbitrationId, NodeId};
pub use frame::{Frame, MAX_PAYLOAD};
pub use gateway::GatewayBus;
pub use transport::{BusSubscription, BusTransport, FrameFilter, LoopbackBus};

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown node id 0x{0:02x}")]
    UnknownNode(u8),
    #[error("arbitration id 0x{0:08x} does not fit in 29 bits")]
    IdOutOfRange(u32),
    #[error("frame payload of {0} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    PayloadTooLong(usize),
    #[error("bus is closed")]
    Closed,
}
