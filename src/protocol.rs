//! Tuya wire protocol framing.
//! Handles packet packing, streaming decode with resynchronization, and
//! CRC/HMAC verification.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

/// Header: Prefix(4) + Seq(4) + Cmd(4) + Len(4)
pub const HEADER_LEN: usize = 16;

/// Upper bound on the length field. Anything above this is a corrupt or
/// hostile frame, not a doorbell report.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

const CRC_FOOTER_LEN: usize = 4 + 4; // CRC32 + Suffix
const HMAC_FOOTER_LEN: usize = 32 + 4; // HMAC-SHA256 + Suffix

type HmacSha256 = Hmac<Sha256>;

/// Command codes used on the LAN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
}

impl CommandType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x03 => Some(Self::SessKeyNegStart),
            0x04 => Some(Self::SessKeyNegResp),
            0x05 => Some(Self::SessKeyNegFinish),
            0x07 => Some(Self::Control),
            0x08 => Some(Self::Status),
            0x09 => Some(Self::HeartBeat),
            0x0a => Some(Self::DpQuery),
            0x0d => Some(Self::ControlNew),
            0x10 => Some(Self::DpQueryNew),
            0x12 => Some(Self::UpdateDps),
            _ => None,
        }
    }

    /// Whether outgoing payloads for this command carry the 15-byte
    /// protocol-version marker. Query, heartbeat, and key-negotiation
    /// commands never do.
    pub fn carries_version_header(self) -> bool {
        !matches!(
            self,
            Self::DpQuery
                | Self::DpQueryNew
                | Self::UpdateDps
                | Self::HeartBeat
                | Self::SessKeyNegStart
                | Self::SessKeyNegResp
                | Self::SessKeyNegFinish
        )
    }
}

/// Protocol sub-version, fixed per device at connection time.
/// Governs the payload envelope and cipher mode; the frame layout is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1")]
    V3_1,
    #[serde(rename = "3.2")]
    V3_2,
    #[serde(rename = "3.3")]
    V3_3,
    #[serde(rename = "3.4")]
    V3_4,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V3_1 => "3.1",
            Self::V3_2 => "3.2",
            Self::V3_3 => "3.3",
            Self::V3_4 => "3.4",
        }
    }

    /// The three ASCII bytes that open a version header ("3.3" etc.).
    pub fn marker(self) -> &'static [u8; 3] {
        match self {
            Self::V3_1 => b"3.1",
            Self::V3_2 => b"3.2",
            Self::V3_3 => b"3.3",
            Self::V3_4 => b"3.4",
        }
    }

    /// v3.4 frames carry an HMAC-SHA256 footer instead of CRC32.
    pub fn uses_hmac(self) -> bool {
        matches!(self, Self::V3_4)
    }

    /// v3.4 requires a session-key handshake before any data exchange.
    pub fn needs_handshake(self) -> bool {
        matches!(self, Self::V3_4)
    }

    /// v3.4 devices expect the New variants of control and query commands.
    pub fn effective_command(self, cmd: CommandType) -> CommandType {
        if matches!(self, Self::V3_4) {
            match cmd {
                CommandType::Control => CommandType::ControlNew,
                CommandType::DpQuery => CommandType::DpQueryNew,
                other => other,
            }
        } else {
            cmd
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "3.1" => Ok(Self::V3_1),
            "3.2" => Ok(Self::V3_2),
            "3.3" => Ok(Self::V3_3),
            "3.4" => Ok(Self::V3_4),
            other => Err(TuyaError::Malformed(format!(
                "unsupported protocol version '{other}'"
            ))),
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code, when the device prepended one to the payload
    pub retcode: Option<u32>,
    /// Payload bytes (still encrypted for encrypted versions)
    pub payload: Vec<u8>,
}

impl TuyaMessage {
    pub fn new(seqno: u32, cmd: CommandType, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            cmd: cmd as u32,
            retcode: None,
            payload,
        }
    }

    pub fn command(&self) -> Option<CommandType> {
        CommandType::from_u32(self.cmd)
    }
}

/// Pack a message into wire bytes.
/// With an HMAC key the footer is HMAC-SHA256 (v3.4); otherwise CRC32.
pub fn pack_message(msg: &TuyaMessage, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let footer_len = if hmac_key.is_some() {
        HMAC_FOOTER_LEN
    } else {
        CRC_FOOTER_LEN
    };
    let payload_len = msg.payload.len() + footer_len;
    if payload_len > MAX_PAYLOAD_LEN as usize {
        return Err(TuyaError::Malformed("payload too large".into()));
    }

    let mut data = Vec::with_capacity(HEADER_LEN + payload_len);
    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(msg.seqno)?;
    data.write_u32::<BigEndian>(msg.cmd)?;
    data.write_u32::<BigEndian>(payload_len as u32)?;
    data.extend_from_slice(&msg.payload);

    if let Some(key) = hmac_key {
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
        mac.update(&data);
        data.extend_from_slice(&mac.finalize().into_bytes());
    } else {
        let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let crc_val = crc32.checksum(&data);
        data.write_u32::<BigEndian>(crc_val)?;
    }
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;

    Ok(data)
}

/// Outcome of one streaming decode step over a growing receive buffer.
#[derive(Debug)]
pub enum Unframed {
    /// A complete, verified frame and the number of buffer bytes it spans
    /// (including any leading garbage that was skipped to reach it).
    Frame(TuyaMessage, usize),
    /// Not enough bytes buffered yet. The contained count of leading bytes
    /// is known garbage and may be discarded before the next read.
    NeedMore(usize),
    /// A frame-shaped region failed validation. The caller discards the
    /// contained number of bytes and decodes again from the next prefix.
    Corrupt(TuyaError, usize),
}

/// Decode one frame from the front of `buf`.
///
/// The decoder never assumes a frame arrives in one socket read: short
/// buffers yield [`Unframed::NeedMore`]. A byte stream that does not start
/// with the prefix magic is scanned forward for the next prefix rather than
/// rejected wholesale.
pub fn unframe(buf: &[u8], hmac_key: Option<&[u8]>) -> Unframed {
    let start = match find_prefix(buf) {
        Some(pos) => pos,
        // Keep the last 3 bytes: they may be the start of a split prefix.
        None => return Unframed::NeedMore(buf.len().saturating_sub(3)),
    };

    let frame = &buf[start..];
    if frame.len() < HEADER_LEN {
        return Unframed::NeedMore(start);
    }

    let seqno = BigEndian::read_u32(&frame[4..8]);
    let cmd = BigEndian::read_u32(&frame[8..12]);
    let payload_len = BigEndian::read_u32(&frame[12..16]);

    let footer_len = if hmac_key.is_some() {
        HMAC_FOOTER_LEN
    } else {
        CRC_FOOTER_LEN
    };
    if payload_len > MAX_PAYLOAD_LEN || (payload_len as usize) < footer_len {
        // Skip the bogus prefix and rescan.
        return Unframed::Corrupt(
            TuyaError::Malformed(format!("impossible length field {payload_len}")),
            start + 4,
        );
    }

    let total_len = HEADER_LEN + payload_len as usize;
    if frame.len() < total_len {
        return Unframed::NeedMore(start);
    }

    let suffix = BigEndian::read_u32(&frame[total_len - 4..total_len]);
    if suffix != SUFFIX_55AA {
        return Unframed::Corrupt(TuyaError::Malformed("missing suffix magic".into()), start + 4);
    }

    let checksum_end = total_len - footer_len;
    let footer = &frame[checksum_end..total_len - 4];
    if let Some(key) = hmac_key {
        let mut mac = match HmacSha256::new_from_slice(key) {
            Ok(m) => m,
            Err(_) => return Unframed::Corrupt(TuyaError::HmacMismatch, start + total_len),
        };
        mac.update(&frame[..checksum_end]);
        if mac.verify_slice(footer).is_err() {
            return Unframed::Corrupt(TuyaError::HmacMismatch, start + total_len);
        }
    } else {
        let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let calc = crc32.checksum(&frame[..checksum_end]);
        let recv = BigEndian::read_u32(footer);
        if calc != recv {
            return Unframed::Corrupt(TuyaError::CrcMismatch, start + total_len);
        }
    }

    let mut payload_start = HEADER_LEN;
    let mut retcode = None;
    if has_retcode(&frame[payload_start..checksum_end]) {
        retcode = Some(BigEndian::read_u32(&frame[payload_start..payload_start + 4]));
        payload_start += 4;
    }

    let msg = TuyaMessage {
        seqno,
        cmd,
        retcode,
        payload: frame[payload_start..checksum_end].to_vec(),
    };
    Unframed::Frame(msg, start + total_len)
}

fn find_prefix(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    (0..=buf.len() - 4).find(|&i| BigEndian::read_u32(&buf[i..i + 4]) == PREFIX_55AA)
}

/// Devices prepend a 4-byte return code to response payloads. There is no
/// flag for it, so detect it by shape: return codes are tiny big-endian
/// integers (three leading zero bytes), which neither JSON, version
/// markers, nor ciphertext plausibly start with.
fn has_retcode(body: &[u8]) -> bool {
    body.len() >= 4 && body[0] == 0 && body[1] == 0 && body[2] == 0
}
