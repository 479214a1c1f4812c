//! DTX message framing
//!
//! ```text
//! +---------------------+
//! |   MessageHeader     | 32 bytes
//! +---------------------+
//! |   PayloadHeader     | 16 bytes
//! +---------------------+
//! |   AuxHeader         | 16 bytes (if aux present)
//! |   Aux data          | variable length
//! +---------------------+
//! |   Payload data      | variable length (NSKeyedArchive)
//! +---------------------+
//! ```
//!
//! Bodies larger than the fragment size go out as a header-only fragment 0 whose length
//! field holds the full body length, then fragments 1..n with the body split in order.
//! Framing and decoding are separate steps so a payload that fails to decode only fails
//! the call it belongs to.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

use super::value::DtxValue;
use crate::IdeviceError;

pub const MAGIC: u32 = 0x1F3D5B79;
pub const MESSAGE_HEADER_LEN: usize = 32;
pub const PAYLOAD_HEADER_LEN: usize = 16;
pub const DEFAULT_FRAGMENT_SIZE: usize = 64 * 1024;

const EXPECTS_REPLY_FLAG: u32 = 0x1000;
const AUX_BUFFER_SIZE: u32 = 496;
const AUX_SEPARATOR: u32 = 0x0a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub fragment_id: u16,
    pub fragment_count: u16,
    /// Body length of this fragment, or of the whole message on a header-only fragment 0
    pub length: u32,
    pub identifier: u32,
    pub conversation_index: u32,
    pub channel: i32,
    pub expects_reply: bool,
}

impl MessageHeader {
    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_LEN] {
        let mut res = [0u8; MESSAGE_HEADER_LEN];
        res[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        res[4..8].copy_from_slice(&(MESSAGE_HEADER_LEN as u32).to_le_bytes());
        res[8..10].copy_from_slice(&self.fragment_id.to_le_bytes());
        res[10..12].copy_from_slice(&self.fragment_count.to_le_bytes());
        res[12..16].copy_from_slice(&self.length.to_le_bytes());
        res[16..20].copy_from_slice(&self.identifier.to_le_bytes());
        res[20..24].copy_from_slice(&self.conversation_index.to_le_bytes());
        res[24..28].copy_from_slice(&self.channel.to_le_bytes());
        res[28..32].copy_from_slice(&u32::from(self.expects_reply).to_le_bytes());
        res
    }

    pub fn parse(buf: &[u8; MESSAGE_HEADER_LEN]) -> Result<Self, IdeviceError> {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let magic = u32_at(0);
        if magic != MAGIC {
            return Err(IdeviceError::InvalidDtxMagic(magic));
        }
        Ok(Self {
            fragment_id: u16::from_le_bytes([buf[8], buf[9]]),
            fragment_count: u16::from_le_bytes([buf[10], buf[11]]),
            length: u32_at(12),
            identifier: u32_at(16),
            conversation_index: u32_at(20),
            channel: u32_at(24) as i32,
            expects_reply: u32_at(28) == 1,
        })
    }

    /// Fragment 0 of a multi-fragment message carries no body
    pub fn is_header_only(&self) -> bool {
        self.fragment_count > 1 && self.fragment_id == 0
    }
}

/// Message type, the low byte of the payload flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ack,
    Invocation,
    Object,
    Error,
    Other(u8),
}

impl MessageKind {
    fn from_flags(flags: u32) -> Self {
        match (flags & 0xff) as u8 {
            0 => Self::Ack,
            2 => Self::Invocation,
            3 => Self::Object,
            4 => Self::Error,
            n => Self::Other(n),
        }
    }

    fn flags(self) -> u32 {
        match self {
            Self::Ack => 0,
            Self::Invocation => 2,
            Self::Object => 3,
            Self::Error => 4,
            Self::Other(n) => n as u32,
        }
    }
}

/// Typed positional argument in the auxiliary buffer
#[derive(Clone, PartialEq)]
pub enum AuxValue {
    String(String),
    /// NSKeyedArchiver bytes
    Bytes(Vec<u8>),
    U32(u32),
    I64(i64),
    F64(f64),
}

impl AuxValue {
    /// Archives a plist value as an argument
    pub fn archived(v: impl Into<plist::Value>) -> Result<Self, IdeviceError> {
        ns_keyed_archive::encode::encode_to_bytes(v.into())
            .map(Self::Bytes)
            .map_err(|e| IdeviceError::ArchiveEncode(format!("{e:?}")))
    }

    /// Unarchives a `Bytes` argument; other variants convert directly
    pub fn to_value(&self) -> Result<DtxValue, IdeviceError> {
        Ok(match self {
            AuxValue::String(s) => DtxValue::String(s.clone()),
            AuxValue::Bytes(b) => DtxValue::from_archive(b)?,
            AuxValue::U32(u) => DtxValue::Integer((*u as u64).into()),
            AuxValue::I64(i) => DtxValue::Integer((*i).into()),
            AuxValue::F64(f) => DtxValue::Real(*f),
        })
    }
}

impl std::fmt::Debug for AuxValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxValue::String(s) => write!(f, "String({s:?})"),
            AuxValue::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            AuxValue::U32(n) => write!(f, "U32({n})"),
            AuxValue::I64(n) => write!(f, "I64({n})"),
            AuxValue::F64(n) => write!(f, "F64({n})"),
        }
    }
}

fn encode_aux(values: &[AuxValue]) -> Vec<u8> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut payload = Vec::new();
    for v in values {
        payload.extend_from_slice(&AUX_SEPARATOR.to_le_bytes());
        match v {
            AuxValue::String(s) => {
                payload.extend_from_slice(&0x01_u32.to_le_bytes());
                payload.extend_from_slice(&(s.len() as u32).to_le_bytes());
                payload.extend_from_slice(s.as_bytes());
            }
            AuxValue::Bytes(b) => {
                payload.extend_from_slice(&0x02_u32.to_le_bytes());
                payload.extend_from_slice(&(b.len() as u32).to_le_bytes());
                payload.extend_from_slice(b);
            }
            AuxValue::U32(u) => {
                payload.extend_from_slice(&0x03_u32.to_le_bytes());
                payload.extend_from_slice(&u.to_le_bytes());
            }
            AuxValue::I64(i) => {
                payload.extend_from_slice(&0x06_u32.to_le_bytes());
                payload.extend_from_slice(&i.to_le_bytes());
            }
            AuxValue::F64(x) => {
                payload.extend_from_slice(&0x09_u32.to_le_bytes());
                payload.extend_from_slice(&x.to_le_bytes());
            }
        }
    }

    let mut res = Vec::with_capacity(16 + payload.len());
    res.extend_from_slice(&AUX_BUFFER_SIZE.to_le_bytes());
    res.extend_from_slice(&0_u32.to_le_bytes());
    res.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    res.extend_from_slice(&0_u32.to_le_bytes());
    res.extend_from_slice(&payload);
    res
}

/// Cursor over the aux section with bounds-checked reads
struct AuxReader<'a> {
    bytes: &'a [u8],
}

impl<'a> AuxReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IdeviceError> {
        if self.bytes.len() < n {
            return Err(IdeviceError::NotEnoughBytes(self.bytes.len(), n));
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, IdeviceError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, IdeviceError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn sized(&mut self) -> Result<&'a [u8], IdeviceError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

fn decode_aux(bytes: &[u8]) -> Result<Vec<AuxValue>, IdeviceError> {
    let mut reader = AuxReader { bytes };
    // buffer size, unknown, payload size, unknown
    reader.take(16)?;

    let mut values = Vec::new();
    while reader.bytes.len() >= 4 {
        let tag = reader.u32()?;
        match tag {
            AUX_SEPARATOR => {}
            0x01 => values.push(AuxValue::String(String::from_utf8(reader.sized()?.to_vec())?)),
            0x02 => values.push(AuxValue::Bytes(reader.sized()?.to_vec())),
            0x03 => values.push(AuxValue::U32(reader.u32()?)),
            0x04 | 0x06 => values.push(AuxValue::I64(reader.u64()? as i64)),
            0x09 => values.push(AuxValue::F64(f64::from_bits(reader.u64()?))),
            t => return Err(IdeviceError::UnknownAuxValueType(t)),
        }
    }
    Ok(values)
}

/// A complete, reassembled DTX message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identifier: u32,
    pub conversation_index: u32,
    pub channel: i32,
    pub expects_reply: bool,
    pub kind: MessageKind,
    pub aux: Vec<AuxValue>,
    /// The selector for invocations, the result for replies
    pub payload: Option<DtxValue>,
}

impl Message {
    pub fn invocation(
        identifier: u32,
        channel: i32,
        selector: &str,
        aux: Vec<AuxValue>,
        expects_reply: bool,
    ) -> Self {
        Self {
            identifier,
            conversation_index: 0,
            channel,
            expects_reply,
            kind: MessageKind::Invocation,
            aux,
            payload: Some(DtxValue::String(selector.to_string())),
        }
    }

    /// An empty acknowledgement of `to`
    pub fn ack(to: &Message) -> Self {
        Self {
            identifier: to.identifier,
            conversation_index: to.conversation_index + 1,
            channel: to.channel,
            expects_reply: false,
            kind: MessageKind::Ack,
            aux: Vec::new(),
            payload: None,
        }
    }

    /// Whether this answers one of our own messages
    pub fn is_reply(&self) -> bool {
        self.conversation_index > 0
    }

    /// The selector of an invocation
    pub fn selector(&self) -> Option<&str> {
        self.payload.as_ref().and_then(|p| p.as_str())
    }

    /// Serializes the body: payload header, aux section and archived payload
    pub fn encode_body(&self) -> Result<Vec<u8>, IdeviceError> {
        let aux = encode_aux(&self.aux);
        let data = match self.payload.clone().and_then(DtxValue::into_plist) {
            Some(v) => ns_keyed_archive::encode::encode_to_bytes(v)
                .map_err(|e| IdeviceError::ArchiveEncode(format!("{e:?}")))?,
            None => Vec::new(),
        };

        let mut flags = self.kind.flags();
        if self.expects_reply {
            flags |= EXPECTS_REPLY_FLAG;
        }
        let mut body = Vec::with_capacity(PAYLOAD_HEADER_LEN + aux.len() + data.len());
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(&(aux.len() as u32).to_le_bytes());
        body.extend_from_slice(&((aux.len() + data.len()) as u64).to_le_bytes());
        body.extend_from_slice(&aux);
        body.extend_from_slice(&data);
        Ok(body)
    }

    /// Splits the encoded message into wire frames of at most `max_fragment` body bytes
    pub fn into_frames(&self, max_fragment: usize) -> Result<Vec<Vec<u8>>, IdeviceError> {
        let body = self.encode_body()?;
        let header = |fragment_id, fragment_count, length: usize| MessageHeader {
            fragment_id,
            fragment_count,
            length: length as u32,
            identifier: self.identifier,
            conversation_index: self.conversation_index,
            channel: self.channel,
            expects_reply: self.expects_reply,
        };

        if body.len() <= max_fragment {
            let mut frame = header(0, 1, body.len()).to_bytes().to_vec();
            frame.extend_from_slice(&body);
            return Ok(vec![frame]);
        }

        let chunks: Vec<&[u8]> = body.chunks(max_fragment.max(1)).collect();
        let count = u16::try_from(chunks.len() + 1)
            .map_err(|_| IdeviceError::InvalidState("message has too many fragments"))?;
        let mut frames = Vec::with_capacity(chunks.len() + 1);
        frames.push(header(0, count, body.len()).to_bytes().to_vec());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut frame = header(i as u16 + 1, count, chunk.len()).to_bytes().to_vec();
            frame.extend_from_slice(chunk);
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decodes a reassembled body
    pub fn decode(header: &MessageHeader, body: &[u8]) -> Result<Self, IdeviceError> {
        let mut message = Self {
            identifier: header.identifier,
            conversation_index: header.conversation_index,
            channel: header.channel,
            expects_reply: header.expects_reply,
            kind: MessageKind::Ack,
            aux: Vec::new(),
            payload: None,
        };
        if body.is_empty() {
            return Ok(message);
        }
        if body.len() < PAYLOAD_HEADER_LEN {
            return Err(IdeviceError::NotEnoughBytes(body.len(), PAYLOAD_HEADER_LEN));
        }

        let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let aux_length = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
        let total_length = u64::from_le_bytes([
            body[8], body[9], body[10], body[11], body[12], body[13], body[14], body[15],
        ]) as usize;
        let rest = &body[PAYLOAD_HEADER_LEN..];
        if total_length < aux_length || rest.len() < total_length {
            return Err(IdeviceError::NotEnoughBytes(rest.len(), total_length));
        }

        message.kind = MessageKind::from_flags(flags);
        if aux_length > 0 {
            message.aux = decode_aux(&rest[..aux_length])?;
        }
        let data = &rest[aux_length..total_length];
        if !data.is_empty() {
            message.payload = Some(DtxValue::from_archive(data)?);
        }
        Ok(message)
    }
}

/// Reads one wire frame; header-only fragments come back with an empty body
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(MessageHeader, Vec<u8>), IdeviceError> {
    let mut buf = [0u8; MESSAGE_HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    let header = MessageHeader::parse(&buf)?;
    if header.is_header_only() {
        return Ok((header, Vec::new()));
    }
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

#[derive(Debug)]
struct Partial {
    header: MessageHeader,
    next: u16,
    buf: Vec<u8>,
}

/// Buffers fragments until a message is complete
///
/// Partial messages are keyed by (identifier, conversation index, channel). Anything
/// left here when the connection ends is simply dropped.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    partial: HashMap<(u32, u32, i32), Partial>,
}

impl FragmentAssembler {
    /// Feeds one frame, returning the full body once the last fragment arrives
    pub fn push(&mut self, header: MessageHeader, body: Vec<u8>) -> Option<(MessageHeader, Vec<u8>)> {
        if header.fragment_count <= 1 {
            return Some((header, body));
        }
        let key = (header.identifier, header.conversation_index, header.channel);

        if header.fragment_id == 0 {
            if self.partial.contains_key(&key) {
                warn!("Restarted fragmented message {}, dropping partial", header.identifier);
            }
            self.partial.insert(
                key,
                Partial {
                    header,
                    next: 1,
                    buf: Vec::with_capacity(header.length as usize),
                },
            );
            return None;
        }

        let Some(partial) = self.partial.get_mut(&key) else {
            warn!(
                "{}",
                IdeviceError::UnexpectedFragment {
                    identifier: header.identifier,
                    fragment: header.fragment_id,
                    count: header.fragment_count,
                }
            );
            return None;
        };
        if partial.next != header.fragment_id || partial.header.fragment_count != header.fragment_count {
            warn!(
                "Fragment {} of message {} out of sequence (expected {}), dropping message",
                header.fragment_id, header.identifier, partial.next
            );
            self.partial.remove(&key);
            return None;
        }

        trace!(
            "Fragment {}/{} of message {} ({} bytes)",
            header.fragment_id,
            header.fragment_count,
            header.identifier,
            body.len()
        );
        partial.buf.extend_from_slice(&body);
        partial.next += 1;
        if header.fragment_id + 1 < header.fragment_count {
            return None;
        }

        let partial = self.partial.remove(&key)?;
        let mut header = partial.header;
        header.fragment_id = header.fragment_count - 1;
        header.length = partial.buf.len() as u32;
        Some((header, partial.buf))
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(bytes: Vec<u8>) -> Vec<Message> {
        let mut reader = &bytes[..];
        let mut assembler = FragmentAssembler::default();
        let mut out = Vec::new();
        while !reader.is_empty() {
            let (header, body) = read_frame(&mut reader).await.unwrap();
            if let Some((header, body)) = assembler.push(header, body) {
                out.push(Message::decode(&header, &body).unwrap());
            }
        }
        out
    }

    fn sample(identifier: u32) -> Message {
        Message::invocation(
            identifier,
            -3,
            "setConfig:",
            vec![
                AuxValue::String("pid".into()),
                AuxValue::U32(7),
                AuxValue::I64(-9),
                AuxValue::F64(0.25),
                AuxValue::archived(plist::Value::String("x".repeat(4000))).unwrap(),
            ],
            true,
        )
    }

    #[test]
    fn header_layout() {
        let header = MessageHeader {
            fragment_id: 1,
            fragment_count: 3,
            length: 10,
            identifier: 5,
            conversation_index: 1,
            channel: -2,
            expects_reply: true,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x79, 0x5B, 0x3D, 0x1F]);
        assert_eq!(&bytes[4..8], &[32, 0, 0, 0]);
        assert_eq!(&bytes[24..28], &(-2i32).to_le_bytes());
        assert_eq!(MessageHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = [0u8; MESSAGE_HEADER_LEN];
        bytes[0] = 1;
        assert!(matches!(
            MessageHeader::parse(&bytes),
            Err(IdeviceError::InvalidDtxMagic(1))
        ));
    }

    #[test]
    fn payload_header_marks_expects_reply() {
        let body = sample(1).encode_body().unwrap();
        let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        assert_eq!(flags, 0x1002);
        let aux_len = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
        assert_eq!(&body[16..20], &AUX_BUFFER_SIZE.to_le_bytes());
        assert_eq!(&body[32..36], &AUX_SEPARATOR.to_le_bytes());
        assert!(aux_len > 4000);
    }

    #[tokio::test]
    async fn fragmented_message_decodes_like_unfragmented() {
        let message = sample(9);
        let whole = message.into_frames(DEFAULT_FRAGMENT_SIZE).unwrap();
        assert_eq!(whole.len(), 1);

        let fragments = message.into_frames(1000).unwrap();
        assert!(fragments.len() > 2);
        let first = MessageHeader::parse(fragments[0][..32].try_into().unwrap()).unwrap();
        assert_eq!(fragments[0].len(), MESSAGE_HEADER_LEN);
        assert_eq!(first.length as usize, message.encode_body().unwrap().len());

        let a = read_all(whole.concat()).await;
        let b = read_all(fragments.concat()).await;
        assert_eq!(a, b);
        assert_eq!(a[0], message);
    }

    #[test]
    fn out_of_sequence_fragment_drops_partial() {
        let frames = sample(4).into_frames(1000).unwrap();
        let mut assembler = FragmentAssembler::default();
        let split = |f: &Vec<u8>| {
            let header = MessageHeader::parse(f[..32].try_into().unwrap()).unwrap();
            (header, f[32..].to_vec())
        };
        let (h, b) = split(&frames[0]);
        assert!(assembler.push(h, b).is_none());
        let (h, b) = split(&frames[2]);
        assert!(assembler.push(h, b).is_none());
        assert_eq!(assembler.pending(), 0);
        for f in &frames[3..] {
            let (h, b) = split(f);
            assert!(assembler.push(h, b).is_none());
        }
    }

    #[test]
    fn ack_answers_in_the_next_conversation_slot() {
        let mut incoming = sample(12);
        incoming.conversation_index = 0;
        let ack = Message::ack(&incoming);
        assert_eq!((ack.identifier, ack.conversation_index), (12, 1));
        assert!(ack.is_reply());
        let body = ack.encode_body().unwrap();
        assert_eq!(body, [0u8; 16]);
    }

    #[test]
    fn decodes_device_integer_tags() {
        let mut aux = Vec::new();
        for (tag, v) in [(0x04u32, 5i64), (0x06, -1)] {
            aux.extend_from_slice(&AUX_SEPARATOR.to_le_bytes());
            aux.extend_from_slice(&tag.to_le_bytes());
            aux.extend_from_slice(&v.to_le_bytes());
        }
        let mut section = vec![0u8; 16];
        section.extend_from_slice(&aux);
        assert_eq!(
            decode_aux(&section).unwrap(),
            [AuxValue::I64(5), AuxValue::I64(-1)]
        );

        section.extend_from_slice(&0x77u32.to_le_bytes());
        section.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            decode_aux(&section),
            Err(IdeviceError::UnknownAuxValueType(0x77))
        ));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let body = sample(2).encode_body().unwrap();
        let header = MessageHeader {
            fragment_id: 0,
            fragment_count: 1,
            length: 20,
            identifier: 2,
            conversation_index: 0,
            channel: 1,
            expects_reply: true,
        };
        assert!(matches!(
            Message::decode(&header, &body[..20]),
            Err(IdeviceError::NotEnoughBytes(..))
        ));
    }
}
