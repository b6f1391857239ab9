use std::io::ErrorKind;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::transport::{BusSubscription, BusTransport, FrameFilter};
use crate::{ArbitrationId, BusError, Frame, MAX_PAYLOAD};

/// TCP client for a CAN-over-TCP gateway. Wire form per frame: 4 byte
/// big-endian raw arbitration id, 1 byte payload length, payload bytes.
pub struct GatewayBus {
    writer: Mutex<OwnedWriteHalf>,
    tx: broadcast::Sender<Frame>,
    read_task: JoinHandle<()>,
}

impl GatewayBus {
    pub async fn connect<A: ToSocketAddrs>(addr: A, capacity: usize) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();

        let (tx, _) = broadcast::channel(capacity);
        let fan_out = tx.clone();
        let read_task = tokio::spawn(read_loop(reader, fan_out));

        Ok(Self {
            writer: Mutex::new(writer),
            tx,
            read_task,
        })
    }
}

async fn read_loop(mut reader: OwnedReadHalf, fan_out: broadcast::Sender<Frame>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                debug!("gateway frame 0x{:08x}", frame.id.encode());
                let _ = fan_out.send(frame);
            }
            Err(BusError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("gateway closed the connection");
                break;
            }
            Err(BusError::Io(e)) => {
                error!("gateway read failed: {}", e);
                break;
            }
            // header and payload were consumed, the stream is still in sync
            Err(e) => debug!("skipping malformed gateway frame: {}", e),
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Frame, BusError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let raw = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = header[4] as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let id = ArbitrationId::decode(raw)?;
    Frame::new(id, payload)
}

fn frame_bytes(frame: &Frame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(5 + frame.payload.len());
    bytes.extend_from_slice(&frame.id.encode().to_be_bytes());
    bytes.push(frame.payload.len() as u8);
    bytes.extend_from_slice(&frame.payload);
    bytes
}

#[async_trait]
impl BusTransport for GatewayBus {
    async fn send(&self, frame: Frame) -> Result<(), BusError> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(BusError::PayloadTooLong(frame.payload.len()));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame_bytes(&frame)).await?;
        Ok(())
    }

    fn subscribe(&self, filter: FrameFilter) -> BusSubscription {
        BusSubscription::new(self.tx.subscribe(), filter)
    }
}

impl Drop for GatewayBus {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
