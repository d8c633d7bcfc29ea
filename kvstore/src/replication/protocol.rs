//! Replication wire protocol.
//!
//! Every message travels as one frame:
//!
//! ```text
//! [frame_len: u32][code: u8][fixed header][key][value]
//! ```
//!
//! `frame_len` counts the bytes after itself. All integers are little-endian.
//! A replica that sees a connection end mid-frame can tell the tail was cut
//! off, because fewer than `frame_len` bytes arrived.
//!
//! # Invariants
//!
//! - Key sizes never exceed [`MAX_KEY_SIZE`]
//! - A decoded frame is consumed exactly; leftover bytes are an error

#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::replication::mutation::{AddPolicy, AppendPrependKind, IncrDecrKind, ReplacePolicy};
use crate::storage::btree::{KeyError, MAX_KEY_SIZE, StoreKey};
use crate::timestamp::ReplTimestamp;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const FRAME_LEN_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageCode {
    GetCas = 1,
    Sarc = 2,
    Incr = 3,
    Decr = 4,
    Append = 5,
    Prepend = 6,
    Delete = 7,
    Nop = 8,
    BackfillComplete = 9,
    BackfillRequest = 10,
}

impl TryFrom<u8> for MessageCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::GetCas,
            2 => Self::Sarc,
            3 => Self::Incr,
            4 => Self::Decr,
            5 => Self::Append,
            6 => Self::Prepend,
            7 => Self::Delete,
            8 => Self::Nop,
            9 => Self::BackfillComplete,
            10 => Self::BackfillRequest,
            other => return Err(ProtocolError::UnknownCode(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplMessage {
    GetCas {
        proposed_cas: u64,
        timestamp: ReplTimestamp,
        key: StoreKey,
    },
    Sarc {
        timestamp: ReplTimestamp,
        proposed_cas: u64,
        flags: u32,
        exptime: u32,
        add_policy: AddPolicy,
        replace_policy: ReplacePolicy,
        old_cas: u64,
        key: StoreKey,
        value: Vec<u8>,
    },
    IncrDecr {
        kind: IncrDecrKind,
        timestamp: ReplTimestamp,
        proposed_cas: u64,
        amount: u64,
        key: StoreKey,
    },
    AppendPrepend {
        kind: AppendPrependKind,
        timestamp: ReplTimestamp,
        proposed_cas: u64,
        key: StoreKey,
        value: Vec<u8>,
    },
    Delete {
        timestamp: ReplTimestamp,
        key: StoreKey,
    },
    Nop {
        timestamp: ReplTimestamp,
    },
    BackfillComplete {
        time_barrier_timestamp: ReplTimestamp,
    },
    BackfillRequest {
        since_when: ReplTimestamp,
    },
}

impl ReplMessage {
    #[must_use]
    pub const fn code(&self) -> MessageCode {
        match self {
            Self::GetCas { .. } => MessageCode::GetCas,
            Self::Sarc { .. } => MessageCode::Sarc,
            Self::IncrDecr {
                kind: IncrDecrKind::Incr,
                ..
            } => MessageCode::Incr,
            Self::IncrDecr {
                kind: IncrDecrKind::Decr,
                ..
            } => MessageCode::Decr,
            Self::AppendPrepend {
                kind: AppendPrependKind::Append,
                ..
            } => MessageCode::Append,
            Self::AppendPrepend {
                kind: AppendPrependKind::Prepend,
                ..
            } => MessageCode::Prepend,
            Self::Delete { .. } => MessageCode::Delete,
            Self::Nop { .. } => MessageCode::Nop,
            Self::BackfillComplete { .. } => MessageCode::BackfillComplete,
            Self::BackfillRequest { .. } => MessageCode::BackfillRequest,
        }
    }

    /// Timestamp that orders this message on the real-time stream.
    ///
    /// Backfill traffic is not part of that ordering and returns `None`.
    #[must_use]
    pub const fn timestamp(&self) -> Option<ReplTimestamp> {
        match self {
            Self::GetCas { timestamp, .. }
            | Self::Sarc { timestamp, .. }
            | Self::IncrDecr { timestamp, .. }
            | Self::AppendPrepend { timestamp, .. }
            | Self::Delete { timestamp, .. }
            | Self::Nop { timestamp } => Some(*timestamp),
            Self::BackfillComplete { .. } | Self::BackfillRequest { .. } => None,
        }
    }

    /// Encode as a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = vec![0u8; FRAME_LEN_SIZE];
        frame.push(self.code() as u8);

        match self {
            Self::GetCas {
                proposed_cas,
                timestamp,
                key,
            } => {
                put_u64(&mut frame, *proposed_cas);
                put_u64(&mut frame, timestamp.time());
                frame.push(key.len() as u8);
                frame.extend_from_slice(key.as_bytes());
            }
            Self::Sarc {
                timestamp,
                proposed_cas,
                flags,
                exptime,
                add_policy,
                replace_policy,
                old_cas,
                key,
                value,
            } => {
                put_u64(&mut frame, timestamp.time());
                put_u64(&mut frame, *proposed_cas);
                put_u32(&mut frame, *flags);
                put_u32(&mut frame, *exptime);
                frame.push(key.len() as u8);
                put_u32(&mut frame, value_len(value)?);
                frame.push(*add_policy as u8);
                frame.push(*replace_policy as u8);
                put_u64(&mut frame, *old_cas);
                frame.extend_from_slice(key.as_bytes());
                frame.extend_from_slice(value);
            }
            Self::IncrDecr {
                timestamp,
                proposed_cas,
                amount,
                key,
                ..
            } => {
                put_u64(&mut frame, timestamp.time());
                put_u64(&mut frame, *proposed_cas);
                put_u64(&mut frame, *amount);
                frame.push(key.len() as u8);
                frame.extend_from_slice(key.as_bytes());
            }
            Self::AppendPrepend {
                timestamp,
                proposed_cas,
                key,
                value,
                ..
            } => {
                put_u64(&mut frame, timestamp.time());
                put_u64(&mut frame, *proposed_cas);
                frame.push(key.len() as u8);
                put_u32(&mut frame, value_len(value)?);
                frame.extend_from_slice(key.as_bytes());
                frame.extend_from_slice(value);
            }
            Self::Delete { timestamp, key } => {
                put_u64(&mut frame, timestamp.time());
                frame.push(key.len() as u8);
                frame.extend_from_slice(key.as_bytes());
            }
            Self::Nop { timestamp } => put_u64(&mut frame, timestamp.time()),
            Self::BackfillComplete {
                time_barrier_timestamp,
            } => put_u64(&mut frame, time_barrier_timestamp.time()),
            Self::BackfillRequest { since_when } => put_u64(&mut frame, since_when.time()),
        }

        let body_len = frame.len() - FRAME_LEN_SIZE;
        if body_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(body_len));
        }
        frame[..FRAME_LEN_SIZE].copy_from_slice(&(body_len as u32).to_le_bytes());
        Ok(frame)
    }

    /// Decode a frame body (everything after the length prefix).
    pub fn decode_frame(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = FrameReader::new(body);
        let code = MessageCode::try_from(reader.u8()?)?;

        let message = match code {
            MessageCode::GetCas => {
                let proposed_cas = reader.u64()?;
                let timestamp = reader.timestamp()?;
                let key_size = reader.u8()?;
                Self::GetCas {
                    proposed_cas,
                    timestamp,
                    key: reader.key(key_size)?,
                }
            }
            MessageCode::Sarc => {
                let timestamp = reader.timestamp()?;
                let proposed_cas = reader.u64()?;
                let flags = reader.u32()?;
                let exptime = reader.u32()?;
                let key_size = reader.u8()?;
                let value_size = reader.u32()?;
                let add_policy =
                    AddPolicy::try_from(reader.u8()?).map_err(ProtocolError::InvalidPolicy)?;
                let replace_policy =
                    ReplacePolicy::try_from(reader.u8()?).map_err(ProtocolError::InvalidPolicy)?;
                let old_cas = reader.u64()?;
                let key = reader.key(key_size)?;
                Self::Sarc {
                    timestamp,
                    proposed_cas,
                    flags,
                    exptime,
                    add_policy,
                    replace_policy,
                    old_cas,
                    key,
                    value: reader.take(value_size as usize)?.to_vec(),
                }
            }
            MessageCode::Incr | MessageCode::Decr => {
                let kind = if code == MessageCode::Incr {
                    IncrDecrKind::Incr
                } else {
                    IncrDecrKind::Decr
                };
                let timestamp = reader.timestamp()?;
                let proposed_cas = reader.u64()?;
                let amount = reader.u64()?;
                let key_size = reader.u8()?;
                Self::IncrDecr {
                    kind,
                    timestamp,
                    proposed_cas,
                    amount,
                    key: reader.key(key_size)?,
                }
            }
            MessageCode::Append | MessageCode::Prepend => {
                let kind = if code == MessageCode::Append {
                    AppendPrependKind::Append
                } else {
                    AppendPrependKind::Prepend
                };
                let timestamp = reader.timestamp()?;
                let proposed_cas = reader.u64()?;
                let key_size = reader.u8()?;
                let value_size = reader.u32()?;
                let key = reader.key(key_size)?;
                Self::AppendPrepend {
                    kind,
                    timestamp,
                    proposed_cas,
                    key,
                    value: reader.take(value_size as usize)?.to_vec(),
                }
            }
            MessageCode::Delete => {
                let timestamp = reader.timestamp()?;
                let key_size = reader.u8()?;
                Self::Delete {
                    timestamp,
                    key: reader.key(key_size)?,
                }
            }
            MessageCode::Nop => Self::Nop {
                timestamp: reader.timestamp()?,
            },
            MessageCode::BackfillComplete => Self::BackfillComplete {
                time_barrier_timestamp: reader.timestamp()?,
            },
            MessageCode::BackfillRequest => Self::BackfillRequest {
                since_when: reader.timestamp()?,
            },
        };

        reader.finish()?;
        Ok(message)
    }
}

/// Read one frame. A clean end of stream between frames yields `Ok(None)`.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ReplMessage>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; FRAME_LEN_SIZE];
    let mut filled = 0;
    while filled < FRAME_LEN_SIZE {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Truncated)
            };
        }
        filled += n;
    }

    let body_len = u32::from_le_bytes(len_bytes) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len));
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;
    ReplMessage::decode_frame(&body).map(Some)
}

/// Write one frame and flush.
pub async fn write_message<W>(writer: &mut W, message: &ReplMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn put_u32(frame: &mut Vec<u8>, value: u32) {
    frame.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(frame: &mut Vec<u8>, value: u64) {
    frame.extend_from_slice(&value.to_le_bytes());
}

fn value_len(value: &[u8]) -> Result<u32, ProtocolError> {
    u32::try_from(value.len()).map_err(|_| ProtocolError::FrameTooLarge(value.len()))
}

struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(ProtocolError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn timestamp(&mut self) -> Result<ReplTimestamp, ProtocolError> {
        self.u64().map(ReplTimestamp::new)
    }

    fn key(&mut self, size: u8) -> Result<StoreKey, ProtocolError> {
        if usize::from(size) > MAX_KEY_SIZE {
            return Err(ProtocolError::InvalidKey(KeyError::TooLong(usize::from(size))));
        }
        let bytes = self.take(usize::from(size))?;
        StoreKey::new(bytes).map_err(ProtocolError::InvalidKey)
    }

    const fn finish(&self) -> Result<(), ProtocolError> {
        let remaining = self.bytes.len() - self.pos;
        if remaining == 0 {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes(remaining))
        }
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(io::Error),
    UnknownCode(u8),
    /// The frame ended before the message did.
    Truncated,
    TrailingBytes(usize),
    FrameTooLarge(usize),
    InvalidKey(KeyError),
    InvalidPolicy(u8),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::UnknownCode(code) => write!(f, "unknown message code {code}"),
            Self::Truncated => write!(f, "truncated frame"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after message"),
            Self::FrameTooLarge(n) => {
                write!(f, "frame of {n} bytes exceeds limit of {MAX_FRAME_SIZE}")
            }
            Self::InvalidKey(e) => write!(f, "invalid key: {e}"),
            Self::InvalidPolicy(value) => write!(f, "invalid policy value {value}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidKey(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> StoreKey {
        StoreKey::try_from(s).expect("valid key")
    }

    fn sarc() -> ReplMessage {
        ReplMessage::Sarc {
            timestamp: ReplTimestamp::new(42),
            proposed_cas: 7,
            flags: 0xdead_beef,
            exptime: 60,
            add_policy: AddPolicy::No,
            replace_policy: ReplacePolicy::IfCasMatches,
            old_cas: 99,
            key: key("user:1"),
            value: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_sarc_frame_layout() {
        let frame = sarc().encode().expect("should encode");

        // code + 8 + 8 + 4 + 4 + 1 + 4 + 1 + 1 + 8 + key + value
        let body_len = 1 + 39 + "user:1".len() + "payload".len();
        assert_eq!(frame.len(), FRAME_LEN_SIZE + body_len);
        assert_eq!(&frame[..4], &(body_len as u32).to_le_bytes());
        assert_eq!(frame[4], MessageCode::Sarc as u8);
        assert_eq!(&frame[5..13], &42u64.to_le_bytes());
        assert!(frame.ends_with(b"user:1payload"));

        let decoded = ReplMessage::decode_frame(&frame[4..]).expect("should decode");
        assert_eq!(decoded, sarc());
    }

    #[test]
    fn test_incr_and_decr_use_distinct_codes() {
        let incr = ReplMessage::IncrDecr {
            kind: IncrDecrKind::Incr,
            timestamp: ReplTimestamp::new(1),
            proposed_cas: 1,
            amount: 5,
            key: key("n"),
        };
        let ReplMessage::IncrDecr {
            timestamp,
            proposed_cas,
            amount,
            key,
            ..
        } = incr.clone()
        else {
            unreachable!()
        };
        let decr = ReplMessage::IncrDecr {
            kind: IncrDecrKind::Decr,
            timestamp,
            proposed_cas,
            amount,
            key,
        };

        let incr_frame = incr.encode().expect("should encode");
        let decr_frame = decr.encode().expect("should encode");
        assert_eq!(incr_frame[4], 3);
        assert_eq!(decr_frame[4], 4);
        assert_eq!(&incr_frame[5..], &decr_frame[5..]);

        let decoded = ReplMessage::decode_frame(&decr_frame[4..]).expect("should decode");
        assert_eq!(decoded, decr);
    }

    #[test]
    fn test_decode_rejects_unknown_code() {
        let result = ReplMessage::decode_frame(&[0x2a, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::UnknownCode(0x2a))));
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let frame = sarc().encode().expect("should encode");
        let body = &frame[4..frame.len() - 1];
        assert!(matches!(
            ReplMessage::decode_frame(body),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut frame = ReplMessage::Nop {
            timestamp: ReplTimestamp::new(3),
        }
        .encode()
        .expect("should encode");
        frame.extend_from_slice(&[1, 2]);
        assert!(matches!(
            ReplMessage::decode_frame(&frame[4..]),
            Err(ProtocolError::TrailingBytes(2))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_key() {
        let mut body = vec![MessageCode::Delete as u8];
        body.extend_from_slice(&5u64.to_le_bytes());
        body.push(251);
        body.extend(std::iter::repeat_n(b'k', 251));
        assert!(matches!(
            ReplMessage::decode_frame(&body),
            Err(ProtocolError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_policy() {
        let mut frame = sarc().encode().expect("should encode");
        // add_policy byte sits after code, ts, cas, flags, exptime, key_size, value_size.
        frame[4 + 1 + 8 + 8 + 4 + 4 + 1 + 4] = 9;
        assert!(matches!(
            ReplMessage::decode_frame(&frame[4..]),
            Err(ProtocolError::InvalidPolicy(9))
        ));
    }

    #[test]
    fn test_invalid_timestamp_survives_the_wire() {
        let delete = ReplMessage::Delete {
            timestamp: ReplTimestamp::INVALID,
            key: key("gone"),
        };
        let frame = delete.encode().expect("should encode");
        assert_eq!(&frame[5..13], &[0xff; 8]);
        let decoded = ReplMessage::decode_frame(&frame[4..]).expect("should decode");
        assert_eq!(decoded.timestamp(), Some(ReplTimestamp::INVALID));
    }

    #[tokio::test]
    async fn test_read_message_sequence_and_clean_eof() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let nop = ReplMessage::Nop {
            timestamp: ReplTimestamp::new(10),
        };
        write_message(&mut client, &sarc()).await.expect("should write");
        write_message(&mut client, &nop).await.expect("should write");
        drop(client);

        let first = read_message(&mut server).await.expect("should read");
        assert_eq!(first, Some(sarc()));
        let second = read_message(&mut server).await.expect("should read");
        assert_eq!(second, Some(nop));
        let end = read_message(&mut server).await.expect("clean eof");
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_read_message_detects_cut_frame() {
        let frame = sarc().encode().expect("should encode");
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&frame[..frame.len() / 2])
            .await
            .expect("should write");
        drop(client);

        assert!(matches!(
            read_message(&mut server).await,
            Err(ProtocolError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_read_message_rejects_huge_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&u32::MAX.to_le_bytes())
            .await
            .expect("should write");

        assert!(matches!(
            read_message(&mut server).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
