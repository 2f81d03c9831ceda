//! Scripted transport for engine tests.

use std::collections::VecDeque;
use std::time::Duration;

use fbl_protocol::{
    crc16, encode_command, Command, CommandKind, FirmwareVersion, FrameKind, ResponseCode,
    START_BYTE,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::transport::{bounded, TpError, Transport};

pub const ACK: [u8; 2] = [START_BYTE, FrameKind::Ack as u8];
pub const NAK: [u8; 2] = [START_BYTE, FrameKind::Nak as u8];

/// What the device does for one read
#[derive(Debug, Clone)]
pub enum Reply {
    Bytes(Vec<u8>),
    /// Answer after the given delay
    Delayed(Duration, Vec<u8>),
    Error(TpError),
    /// Never answer
    Hang,
}

pub struct MockTransport {
    replies: VecDeque<Reply>,
    /// Every buffer handed to `write`, in order
    pub written: Vec<Vec<u8>>,
    /// Byte count of every read, in order
    pub read_requests: Vec<usize>,
    pub fail_writes: Option<TpError>,
    pub connected: bool,
    pub refuse_connect: bool,
    unsolicited: broadcast::Sender<Vec<u8>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (unsolicited, _) = broadcast::channel(4);
        Self {
            replies: VecDeque::new(),
            written: Vec::new(),
            read_requests: Vec::new(),
            fail_writes: None,
            connected: true,
            refuse_connect: false,
            unsolicited,
        }
    }

    pub fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push(Reply::Bytes(bytes.to_vec()));
    }

    /// Replies not consumed yet
    pub fn pending(&self) -> usize {
        self.replies.len()
    }
}

impl Transport for MockTransport {
    async fn connect(&mut self) -> bool {
        if !self.refuse_connect {
            self.connected = true;
        }
        self.connected
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read(
        &mut self,
        count: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TpError> {
        self.read_requests.push(count);
        let reply = self.replies.pop_front();

        let bytes = bounded(timeout, cancel, async move {
            match reply {
                Some(Reply::Bytes(bytes)) => Ok(bytes),
                Some(Reply::Delayed(delay, bytes)) => {
                    tokio::time::sleep(delay).await;
                    Ok(bytes)
                }
                Some(Reply::Error(e)) => Err(e),
                Some(Reply::Hang) => std::future::pending().await,
                None => Err(TpError::Timeout),
            }
        })
        .await?;

        if bytes.len() != count {
            return Err(TpError::InvalidLength {
                expected: count,
                received: bytes.len(),
            });
        }
        Ok(bytes)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TpError> {
        if let Some(e) = self.fail_writes {
            return Err(e);
        }
        self.written.push(data.to_vec());
        Ok(())
    }

    fn subscribe_unsolicited(&self) -> broadcast::Receiver<Vec<u8>> {
        self.unsolicited.subscribe()
    }
}

/// Generic response frame answering a command of `kind`
pub fn generic_response(status: ResponseCode, kind: CommandKind) -> Vec<u8> {
    encode_command(&Command::new(
        CommandKind::ResponseGeneric,
        vec![status.code(), kind as u32],
    ))
    .unwrap()
}

pub fn property_response(status: ResponseCode, value: u32) -> Vec<u8> {
    encode_command(&Command::new(
        CommandKind::GetPropertyResponse,
        vec![status.code(), value],
    ))
    .unwrap()
}

pub fn ping_response(version: FirmwareVersion, options: u16) -> Vec<u8> {
    let [opt_lo, opt_hi] = options.to_le_bytes();
    let mut bytes = vec![
        START_BYTE,
        FrameKind::PingResponse as u8,
        version.patch,
        version.minor,
        version.major,
        b'P',
        opt_lo,
        opt_hi,
    ];
    let crc = crc16(&[&bytes[..]]);
    bytes.extend_from_slice(&crc.to_le_bytes());
    bytes
}
