//! Inbound unit classification.
//!
//! Each unit the pool sends starts with one byte that tells the two wire
//! formats apart. [`EX_MESSAGE_MAGIC`] starts a binary Ex-Message; any other
//! byte starts a JSON line.
//!
//! Ex-Message layout (little-endian):
//!
//! ```text
//! ┌───────────┬───────────┬──────────────────┬──────────────────┐
//! │ Magic     │ Type      │ Length (2B LE)   │ Body             │
//! │ 0x7F      │ (1B)      │ incl. header     │ (Length - 4)     │
//! └───────────┴───────────┴──────────────────┴──────────────────┘
//! ```

use bytes::Buf;

use super::connection::Transport;
use super::error::{UpstreamError, UpstreamResult};

/// First byte of every Ex-Message frame.
pub const EX_MESSAGE_MAGIC: u8 = 0x7f;

/// Ex-Message header size: magic (1) + type (1) + length (2).
pub const EX_MESSAGE_HEADER_SIZE: usize = 4;

/// Decoded Ex-Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExMessageHeader {
    /// Message type / command
    pub kind: u8,
    /// Total frame length, header included
    pub length: u16,
}

impl ExMessageHeader {
    /// Decode a header and check its declared length.
    pub fn parse(raw: [u8; EX_MESSAGE_HEADER_SIZE]) -> UpstreamResult<Self> {
        let mut buf = &raw[..];
        let _magic = buf.get_u8();
        let kind = buf.get_u8();
        let length = buf.get_u16_le();

        if usize::from(length) < EX_MESSAGE_HEADER_SIZE {
            return Err(UpstreamError::BrokenExMessage { length });
        }

        Ok(Self { kind, length })
    }

    /// Number of body bytes following the header.
    pub fn body_len(&self) -> usize {
        usize::from(self.length) - EX_MESSAGE_HEADER_SIZE
    }
}

/// One unit read from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUnit {
    /// A JSON line, delimiter included
    Line(Vec<u8>),
    /// An Ex-Message whose body has been skipped
    ExMessage(ExMessageHeader),
}

/// Read the next unit, skipping Ex-Message bodies.
///
/// During the handshake Ex-Messages are not interpreted, only consumed so
/// the stream stays aligned on unit boundaries.
pub async fn read_unit(transport: &mut dyn Transport) -> UpstreamResult<InboundUnit> {
    if transport.peek_byte().await? != EX_MESSAGE_MAGIC {
        return Ok(InboundUnit::Line(transport.read_line().await?));
    }

    let header = ExMessageHeader::parse(transport.read_ex_message_header().await?)?;

    if header.body_len() > 0 {
        transport.discard(header.body_len()).await?;
    }

    Ok(InboundUnit::ExMessage(header))
}
