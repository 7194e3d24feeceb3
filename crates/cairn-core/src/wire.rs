//! Cairn wire format: protocol ids and structured-message framing.
//!
//! Every structured message is one frame: a 4-byte little-endian length
//! followed by the bincode encoding of the message. Bodies are per-protocol
//! enums; new variants are only ever appended so older nodes keep decoding
//! the variants they know. Raw transfer bytes bypass this module entirely
//! (see `framing`).

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Protocol ids ──────────────────────────────────────────────────────────────

/// Identifier a stream is opened with. Handlers are registered per id.
/// The string is the protocol-level name and must never change for a given
/// protocol version.
pub type ProtocolId = &'static str;

pub const DISCOVERY_PROTOCOL: ProtocolId = "/cairn/discovery/1.0.0";
pub const SWARM_PROTOCOL: ProtocolId = "/cairn/swarm/1.0.0";
pub const TASK_PROTOCOL: ProtocolId = "/cairn/task/1.0.0";
pub const UPLOAD_PROTOCOL: ProtocolId = "/cairn/upload/1.0.0";
pub const UPLOAD_REPLY_PROTOCOL: ProtocolId = "/cairn/upload-reply/1.0.0";
/// Address lookup served by the TCP transport itself.
pub const PEER_LOOKUP_PROTOCOL: ProtocolId = "/cairn/peer-lookup/1.0.0";

/// All protocols a full node serves.
pub const ALL_PROTOCOLS: [ProtocolId; 5] = [
    DISCOVERY_PROTOCOL,
    SWARM_PROTOCOL,
    TASK_PROTOCOL,
    UPLOAD_PROTOCOL,
    UPLOAD_REPLY_PROTOCOL,
];

// ── Framing ───────────────────────────────────────────────────────────────────

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(msg).map_err(FrameError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the message and the
/// number of bytes consumed. `NeedMore` means the caller should retry with
/// more data.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    let end = LEN_SIZE + len as usize;
    if bytes.len() < end {
        return Err(FrameError::NeedMore);
    }
    let msg = bincode::deserialize(&bytes[LEN_SIZE..end]).map_err(FrameError::Decode)?;
    Ok((msg, end))
}

/// Write one frame to a stream and flush.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame from a stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(FrameError::Decode)
}

/// Error encoding, decoding or moving a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}
