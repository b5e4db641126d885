use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload a single tunnel frame may carry. A whole frame
/// (header plus payload) must fit in one UDP datagram.
pub const MSG_MAX_PAYLOAD: usize = 1024;

/// Fixed wire header: id (u16) + type (u8) + length (u16), big-endian.
pub const HEADER_LEN: usize = 5;

/// The type of frame traveling through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Orderly teardown of one tunnel client.
    Goodbye = 0x01,
    /// Client opens a tunnel; payload is ASCII `"host port"`.
    Hello = 0x02,
    /// Tunnel established; also releases the receiver to connect its TCP end.
    HelloAck = 0x03,
    /// Liveness probe. Parsed but otherwise ignored.
    Keepalive = 0x04,
    /// Bearer data with sequence bit 0.
    Data0 = 0x05,
    /// Bearer data with sequence bit 1.
    Data1 = 0x06,
    /// Acknowledges Data0.
    Ack0 = 0x07,
    /// Acknowledges Data1.
    Ack1 = 0x08,
}

impl FrameType {
    fn from_wire(code: u8) -> Option<FrameType> {
        match code {
            0x01 => Some(FrameType::Goodbye),
            0x02 => Some(FrameType::Hello),
            0x03 => Some(FrameType::HelloAck),
            0x04 => Some(FrameType::Keepalive),
            0x05 => Some(FrameType::Data0),
            0x06 => Some(FrameType::Data1),
            0x07 => Some(FrameType::Ack0),
            0x08 => Some(FrameType::Ack1),
            _ => None,
        }
    }

    /// The DATA frame type carrying the given sequence bit.
    pub fn data(seq: bool) -> FrameType {
        if seq {
            FrameType::Data1
        } else {
            FrameType::Data0
        }
    }

    /// The ACK frame type for the given sequence bit.
    pub fn ack(seq: bool) -> FrameType {
        if seq {
            FrameType::Ack1
        } else {
            FrameType::Ack0
        }
    }

    /// Sequence bit of a DATA or ACK frame, `None` for every other type.
    pub fn seq_bit(self) -> Option<bool> {
        match self {
            FrameType::Data0 | FrameType::Ack0 => Some(false),
            FrameType::Data1 | FrameType::Ack1 => Some(true),
            _ => None,
        }
    }
}

/// Ways a datagram can fail to be a tunnel frame. All of them are
/// non-fatal to the server: the datagram is dropped and the loop goes on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("datagram of {0} bytes is shorter than the frame header")]
    Truncated(usize),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("length field claims {claimed} payload bytes but {actual} are present")]
    LengthMismatch { claimed: usize, actual: usize },
    #[error("payload of {0} bytes exceeds the {MSG_MAX_PAYLOAD} byte cap")]
    PayloadTooLarge(usize),
}

/// One tunnel frame. Exactly one frame per UDP datagram; no codec state
/// is carried between datagrams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Tunnel id this frame belongs to. 0 is reserved for HELLO frames
    /// from clients that have no id yet.
    pub id: u16,
    pub kind: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// A frame with an empty payload (every type except HELLO and DATA).
    pub fn new(id: u16, kind: FrameType) -> Frame {
        Frame {
            id,
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(id: u16, kind: FrameType, payload: Bytes) -> Frame {
        Frame { id, kind, payload }
    }

    /// Serialize into a single datagram.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.payload.len() > MSG_MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16(self.id);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse one datagram. The length field must account for the whole
    /// remainder of the datagram, neither more nor less.
    pub fn decode(datagram: &[u8]) -> Result<Frame, FrameError> {
        if datagram.len() < HEADER_LEN {
            return Err(FrameError::Truncated(datagram.len()));
        }
        let id = u16::from_be_bytes([datagram[0], datagram[1]]);
        let kind = FrameType::from_wire(datagram[2]).ok_or(FrameError::UnknownType(datagram[2]))?;
        let claimed = u16::from_be_bytes([datagram[3], datagram[4]]) as usize;
        let body = &datagram[HEADER_LEN..];
        if claimed != body.len() {
            return Err(FrameError::LengthMismatch {
                claimed,
                actual: body.len(),
            });
        }
        if claimed > MSG_MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(claimed));
        }
        Ok(Frame {
            id,
            kind,
            payload: Bytes::copy_from_slice(body),
        })
    }
}
