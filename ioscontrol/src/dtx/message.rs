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
//! Messages longer than the peer's buffer are split. The first fragment is a
//! bare header announcing the total length and the following fragments carry
//! raw slices of the message with no headers of their own.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::{
    IdeviceError,
    dtx::{lz4, primitive_dictionary::PrimitiveDictionary},
    nskeyedarchive::{self, ArchiveValue},
};

/// Read big-endian from the first four bytes
pub const DTX_MAGIC: u32 = 0x795B_3D1F;
pub const HEADER_LEN: usize = 32;
pub const PAYLOAD_HEADER_LEN: usize = 16;
pub const AUX_HEADER_LEN: usize = 16;
/// Written into the aux sub-header, peers ignore it
const AUX_BUFFER_SIZE: u32 = 496;
/// Largest message or fragment body accepted from a peer
pub const MAX_MESSAGE_LENGTH: u32 = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ack,
    /// Passed through as raw bytes
    UnknownTypeOne,
    MethodInvocation,
    ResponseWithReturnValue,
    Error,
    Lz4Compressed,
    Other(u32),
}

impl From<u32> for MessageKind {
    fn from(value: u32) -> Self {
        match value {
            0 => MessageKind::Ack,
            1 => MessageKind::UnknownTypeOne,
            2 => MessageKind::MethodInvocation,
            3 => MessageKind::ResponseWithReturnValue,
            4 => MessageKind::Error,
            0x0707 => MessageKind::Lz4Compressed,
            v => MessageKind::Other(v),
        }
    }
}

impl From<MessageKind> for u32 {
    fn from(value: MessageKind) -> Self {
        match value {
            MessageKind::Ack => 0,
            MessageKind::UnknownTypeOne => 1,
            MessageKind::MethodInvocation => 2,
            MessageKind::ResponseWithReturnValue => 3,
            MessageKind::Error => 4,
            MessageKind::Lz4Compressed => 0x0707,
            MessageKind::Other(v) => v,
        }
    }
}

/// The 32 byte header in front of every message and fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub fragment_index: u16,
    pub fragment_count: u16,
    /// Bytes following this header
    pub message_length: u32,
    pub identifier: u32,
    pub conversation_index: u32,
    pub channel_code: i32,
    pub expects_reply: bool,
}

impl MessageHeader {
    pub fn new(identifier: u32, conversation_index: u32, channel_code: i32, expects_reply: bool) -> Self {
        Self {
            fragment_index: 0,
            fragment_count: 1,
            message_length: 0,
            identifier,
            conversation_index,
            channel_code,
            expects_reply,
        }
    }

    /// Parses a header, the magic is checked before anything else
    pub fn parse(buf: &[u8]) -> Result<Self, IdeviceError> {
        if buf.len() < 4 {
            return Err(IdeviceError::DtxIncomplete("less than 4 bytes"));
        }
        let magic = BigEndian::read_u32(buf);
        if magic != DTX_MAGIC {
            return Err(IdeviceError::DtxOutOfSync(magic));
        }
        if buf.len() < HEADER_LEN {
            return Err(IdeviceError::DtxIncomplete("less than 32 bytes"));
        }
        let header_len = LittleEndian::read_u32(&buf[4..]);
        if header_len as usize != HEADER_LEN {
            return Err(IdeviceError::BadHeaderLength(header_len));
        }
        let message_length = LittleEndian::read_u32(&buf[12..]);
        if message_length > MAX_MESSAGE_LENGTH {
            return Err(IdeviceError::DtxMessageTooLarge(message_length));
        }
        Ok(Self {
            fragment_index: LittleEndian::read_u16(&buf[8..]),
            fragment_count: LittleEndian::read_u16(&buf[10..]),
            message_length,
            identifier: LittleEndian::read_u32(&buf[16..]),
            conversation_index: LittleEndian::read_u32(&buf[20..]),
            channel_code: LittleEndian::read_i32(&buf[24..]),
            expects_reply: LittleEndian::read_u32(&buf[28..]) == 1,
        })
    }

    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        BigEndian::write_u32(&mut buf, DTX_MAGIC);
        LittleEndian::write_u32(&mut buf[4..], HEADER_LEN as u32);
        LittleEndian::write_u16(&mut buf[8..], self.fragment_index);
        LittleEndian::write_u16(&mut buf[10..], self.fragment_count);
        LittleEndian::write_u32(&mut buf[12..], self.message_length);
        LittleEndian::write_u32(&mut buf[16..], self.identifier);
        LittleEndian::write_u32(&mut buf[20..], self.conversation_index);
        LittleEndian::write_i32(&mut buf[24..], self.channel_code);
        LittleEndian::write_u32(&mut buf[28..], u32::from(self.expects_reply));
        buf
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_count > 1
    }

    pub fn is_first_fragment(&self) -> bool {
        self.fragment_count > 1 && self.fragment_index == 0
    }

    pub fn is_last_fragment(&self) -> bool {
        self.fragment_count > 1 && self.fragment_count - self.fragment_index == 1
    }
}

/// The 16 byte header describing the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub kind: MessageKind,
    /// Includes the aux sub-header when aux is present
    pub aux_length: u32,
    /// `aux_length` plus the payload body
    pub total_length: u32,
    pub flags: u32,
}

impl PayloadHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, IdeviceError> {
        if buf.len() < PAYLOAD_HEADER_LEN {
            return Err(IdeviceError::DtxIncomplete("payload header missing"));
        }
        Ok(Self {
            kind: LittleEndian::read_u32(buf).into(),
            aux_length: LittleEndian::read_u32(&buf[4..]),
            total_length: LittleEndian::read_u32(&buf[8..]),
            flags: LittleEndian::read_u32(&buf[12..]),
        })
    }

    pub fn serialize(&self) -> [u8; PAYLOAD_HEADER_LEN] {
        let mut buf = [0u8; PAYLOAD_HEADER_LEN];
        LittleEndian::write_u32(&mut buf, self.kind.into());
        LittleEndian::write_u32(&mut buf[4..], self.aux_length);
        LittleEndian::write_u32(&mut buf[8..], self.total_length);
        LittleEndian::write_u32(&mut buf[12..], self.flags);
        buf
    }

    pub fn body_length(&self) -> u32 {
        self.total_length.saturating_sub(self.aux_length)
    }
}

/// Header for auxiliary data section
///
/// Only `aux_size` means anything, the rest is kept for re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxHeader {
    /// Buffer size hint (often 496)
    pub buffer_size: u32,
    pub unknown: u32,
    pub aux_size: u32,
    pub unknown2: u32,
}

impl AuxHeader {
    fn new(aux_size: u32) -> Self {
        Self {
            buffer_size: AUX_BUFFER_SIZE,
            unknown: 0,
            aux_size,
            unknown2: 0,
        }
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            buffer_size: LittleEndian::read_u32(buf),
            unknown: LittleEndian::read_u32(&buf[4..]),
            aux_size: LittleEndian::read_u32(&buf[8..]),
            unknown2: LittleEndian::read_u32(&buf[12..]),
        }
    }

    fn serialize(&self) -> [u8; AUX_HEADER_LEN] {
        let mut buf = [0u8; AUX_HEADER_LEN];
        LittleEndian::write_u32(&mut buf, self.buffer_size);
        LittleEndian::write_u32(&mut buf[4..], self.unknown);
        LittleEndian::write_u32(&mut buf[8..], self.aux_size);
        LittleEndian::write_u32(&mut buf[12..], self.unknown2);
        buf
    }
}

/// A complete, defragmented message
#[derive(Debug, Clone, PartialEq)]
pub struct DtxMessage {
    pub header: MessageHeader,
    pub payload_header: PayloadHeader,
    pub aux_header: Option<AuxHeader>,
    pub aux: PrimitiveDictionary,
    /// Decoded payload body, empty when there is none
    pub payload: Vec<ArchiveValue>,
    /// Set when the body could not be unarchived, `payload` then holds the raw bytes
    pub payload_error: Option<String>,
    /// The message exactly as read
    pub raw: Vec<u8>,
}

/// One unit off the wire
#[derive(Debug, Clone, PartialEq)]
pub enum DtxFrame {
    Message(DtxMessage),
    /// A fragment header or slice, see [`FragmentDecoder`](super::FragmentDecoder)
    Fragment {
        header: MessageHeader,
        /// The 32 byte header for the first fragment, the slice for the rest
        bytes: Vec<u8>,
    },
}

/// Builds a non-fragmented message
///
/// The aux sub-header is only written when `aux` has entries.
pub fn encode(
    identifier: u32,
    conversation_index: u32,
    channel_code: i32,
    expects_reply: bool,
    kind: MessageKind,
    payload: &[u8],
    aux: &PrimitiveDictionary,
) -> Vec<u8> {
    let aux_bytes = aux.serialize();
    let aux_header = if aux_bytes.is_empty() {
        None
    } else {
        Some(AuxHeader::new(aux_bytes.len() as u32))
    };
    let header = MessageHeader::new(identifier, conversation_index, channel_code, expects_reply);
    encode_parts(header, kind, 0, aux_header, &aux_bytes, payload)
}

fn encode_parts(
    mut header: MessageHeader,
    kind: MessageKind,
    flags: u32,
    aux_header: Option<AuxHeader>,
    aux_bytes: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    let aux_length = match aux_header {
        Some(_) => (AUX_HEADER_LEN + aux_bytes.len()) as u32,
        None => 0,
    };
    let payload_header = PayloadHeader {
        kind,
        aux_length,
        total_length: aux_length + payload.len() as u32,
        flags,
    };
    header.message_length = PAYLOAD_HEADER_LEN as u32 + payload_header.total_length;

    let mut res = Vec::with_capacity(HEADER_LEN + header.message_length as usize);
    res.extend_from_slice(&header.serialize());
    res.extend_from_slice(&payload_header.serialize());
    if let Some(a) = aux_header {
        res.extend_from_slice(&a.serialize());
        res.extend_from_slice(aux_bytes);
    }
    res.extend_from_slice(payload);
    res
}

/// The 48 byte acknowledgement for a message that expects a reply
pub fn encode_ack(header: &MessageHeader) -> Vec<u8> {
    let ack = MessageHeader::new(
        header.identifier,
        header.conversation_index + 1,
        header.channel_code,
        false,
    );
    encode_parts(ack, MessageKind::Ack, 0, None, &[], &[])
}

/// Decodes one frame from the front of `bytes` without blocking
///
/// Returns the frame and the bytes after it. Nothing is consumed on
/// [`IdeviceError::DtxIncomplete`], the caller retries with more data.
/// [`IdeviceError::DtxOutOfSync`] means the magic did not match.
pub fn decode(bytes: &[u8]) -> Result<(DtxFrame, &[u8]), IdeviceError> {
    let header = MessageHeader::parse(bytes)?;
    if header.is_first_fragment() {
        let frame = DtxFrame::Fragment {
            header,
            bytes: bytes[..HEADER_LEN].to_vec(),
        };
        return Ok((frame, &bytes[HEADER_LEN..]));
    }

    let total = HEADER_LEN + header.message_length as usize;
    if header.is_fragment() {
        if bytes.len() < total {
            return Err(IdeviceError::DtxIncomplete("fragment lacks bytes"));
        }
        let frame = DtxFrame::Fragment {
            header,
            bytes: bytes[HEADER_LEN..total].to_vec(),
        };
        return Ok((frame, &bytes[total..]));
    }

    let payload_header = PayloadHeader::parse(&bytes[HEADER_LEN..])?;
    if payload_header.aux_length > 0 {
        if bytes.len() < HEADER_LEN + PAYLOAD_HEADER_LEN + AUX_HEADER_LEN {
            return Err(IdeviceError::DtxIncomplete("aux header missing"));
        }
        if bytes.len() < HEADER_LEN + PAYLOAD_HEADER_LEN + payload_header.aux_length as usize {
            return Err(IdeviceError::DtxIncomplete("aux payload missing"));
        }
    }
    if bytes.len() < total {
        return Err(IdeviceError::DtxIncomplete("payload missing"));
    }
    let message = DtxMessage::from_bytes(&bytes[..total])?;
    Ok((DtxFrame::Message(message), &bytes[total..]))
}

/// Reads one frame, blocking until it is complete
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<DtxFrame, IdeviceError> {
    let mut buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut buf).await?;
    let header = MessageHeader::parse(&buf)?;
    if header.is_first_fragment() {
        return Ok(DtxFrame::Fragment {
            header,
            bytes: buf.to_vec(),
        });
    }

    let mut body = vec![0u8; header.message_length as usize];
    reader.read_exact(&mut body).await?;
    if header.is_fragment() {
        return Ok(DtxFrame::Fragment {
            header,
            bytes: body,
        });
    }

    let mut raw = Vec::with_capacity(HEADER_LEN + body.len());
    raw.extend_from_slice(&buf);
    raw.extend_from_slice(&body);
    Ok(DtxFrame::Message(DtxMessage::from_bytes(&raw)?))
}

impl DtxMessage {
    /// Reads one complete message, reassembling fragments as needed
    pub async fn from_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, IdeviceError> {
        let mut defragmenter: Option<super::FragmentDecoder> = None;
        loop {
            match read_frame(reader).await? {
                DtxFrame::Message(m) => return Ok(m),
                DtxFrame::Fragment { header, bytes } => {
                    if header.is_first_fragment() {
                        defragmenter = Some(super::FragmentDecoder::new(header, bytes)?);
                        continue;
                    }
                    let Some(d) = defragmenter.as_mut() else {
                        return Err(IdeviceError::UnexpectedFragment(header.identifier));
                    };
                    if d.add(header, bytes)? {
                        let raw = d.extract();
                        return Self::from_bytes(&raw);
                    }
                }
            }
        }
    }

    /// Parses a whole non-fragmented message, header included
    pub fn from_bytes(raw: &[u8]) -> Result<Self, IdeviceError> {
        let header = MessageHeader::parse(raw)?;
        if header.is_fragment() {
            return Err(IdeviceError::UnexpectedFragment(header.identifier));
        }
        let payload_header = PayloadHeader::parse(&raw[HEADER_LEN..])?;
        let mut offset = HEADER_LEN + PAYLOAD_HEADER_LEN;

        let (aux_header, aux) = if payload_header.aux_length > 0 {
            let end = offset + payload_header.aux_length as usize;
            if raw.len() < end || (payload_header.aux_length as usize) < AUX_HEADER_LEN {
                return Err(IdeviceError::DtxIncomplete("aux payload missing"));
            }
            let aux_header = AuxHeader::parse(&raw[offset..]);
            let aux = PrimitiveDictionary::from_bytes(&raw[offset + AUX_HEADER_LEN..end])?;
            offset = end;
            (Some(aux_header), aux)
        } else {
            (None, PrimitiveDictionary::new())
        };

        let end = offset + payload_header.body_length() as usize;
        let body = raw
            .get(offset..end)
            .ok_or(IdeviceError::DtxIncomplete("payload missing"))?;
        let (payload, payload_error) = decode_payload(payload_header.kind, body)?;

        Ok(Self {
            header,
            payload_header,
            aux_header,
            aux,
            payload,
            payload_error,
            raw: raw[..end].to_vec(),
        })
    }

    /// Re-encodes the message from its parts
    ///
    /// Yields `raw` for anything read off the wire.
    pub fn encode(&self) -> Vec<u8> {
        encode_parts(
            self.header,
            self.payload_header.kind,
            self.payload_header.flags,
            self.aux_header,
            &self.aux.serialize(),
            self.body(),
        )
    }

    /// The undecoded payload body
    pub fn body(&self) -> &[u8] {
        let len = self.payload_header.body_length() as usize;
        &self.raw[self.raw.len() - len..]
    }

    pub fn kind(&self) -> MessageKind {
        self.payload_header.kind
    }

    /// The selector of a method invocation
    pub fn selector(&self) -> Option<&str> {
        self.payload.first().and_then(|p| p.as_string())
    }

    pub fn is_error(&self) -> bool {
        self.payload_header.kind == MessageKind::Error
    }

    /// Text of the first payload element, used for error replies
    pub fn error_text(&self) -> String {
        match self.payload.first() {
            Some(ArchiveValue::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => "no error description".to_string(),
        }
    }
}

fn decode_payload(
    kind: MessageKind,
    body: &[u8],
) -> Result<(Vec<ArchiveValue>, Option<String>), IdeviceError> {
    if body.is_empty() {
        return Ok((Vec::new(), None));
    }
    match kind {
        MessageKind::UnknownTypeOne => Ok((vec![ArchiveValue::Data(body.to_vec())], None)),
        MessageKind::Lz4Compressed => {
            let plain = lz4::decompress(body)?;
            debug!(
                "lz4 compressed {} bytes / {} uncompressed",
                body.len(),
                plain.len()
            );
            match nskeyedarchive::unarchive(&plain) {
                Ok(p) => Ok((p, None)),
                Err(_) => Ok((vec![ArchiveValue::Data(plain)], None)),
            }
        }
        _ => match nskeyedarchive::unarchive(body) {
            Ok(p) => Ok((p, None)),
            Err(e) => {
                warn!("Failed to unarchive {kind:?} payload: {e}");
                Ok((vec![ArchiveValue::Data(body.to_vec())], Some(e.to_string())))
            }
        },
    }
}

impl std::fmt::Display for DtxMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let e = if self.header.expects_reply { "e" } else { "" };
        write!(
            f,
            "i{}.{}{} c{} t:{:?} payload:",
            self.header.identifier,
            self.header.conversation_index,
            e,
            self.header.channel_code,
            self.payload_header.kind
        )?;
        for p in &self.payload {
            write!(f, " {p}")?;
        }
        if !self.aux.is_empty() {
            write!(f, " aux: {}", self.aux)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtx::AuxValue;

    fn ping() -> Vec<u8> {
        nskeyedarchive::archive(&"ping".into()).unwrap()
    }

    #[test]
    fn encode_layout() {
        let payload = ping();
        let bytes = encode(
            42,
            0,
            0,
            true,
            MessageKind::MethodInvocation,
            &payload,
            &PrimitiveDictionary::new(),
        );
        assert_eq!(&bytes[..4], &[0x79, 0x5b, 0x3d, 0x1f]);
        assert_eq!(bytes.len(), 48 + payload.len());

        let ph = PayloadHeader::parse(&bytes[32..]).unwrap();
        assert_eq!(ph.aux_length, 0);
        assert_eq!(ph.total_length as usize, payload.len());
        assert_eq!(&bytes[48..], &payload[..]);
    }

    #[test]
    fn aux_length_includes_sub_header() {
        let mut aux = PrimitiveDictionary::new();
        aux.push(5u32);
        let raw_aux = aux.serialize().len();
        let bytes = encode(1, 0, 3, false, MessageKind::MethodInvocation, &ping(), &aux);

        let ph = PayloadHeader::parse(&bytes[32..]).unwrap();
        assert_eq!(ph.aux_length as usize, raw_aux + 16);
        // sub-header
        assert_eq!(LittleEndian::read_u32(&bytes[48..]), 496);
        assert_eq!(LittleEndian::read_u32(&bytes[56..]) as usize, raw_aux);

        let m = DtxMessage::from_bytes(&bytes).unwrap();
        assert_eq!(m.aux, aux);
        assert_eq!(m.selector(), Some("ping"));
        assert_eq!(m.header.channel_code, 3);
    }

    #[test]
    fn aux_without_payload() {
        let mut aux = PrimitiveDictionary::new();
        aux.push(AuxValue::I64(-2));
        let bytes = encode(9, 1, 1, false, MessageKind::ResponseWithReturnValue, &[], &aux);
        let m = DtxMessage::from_bytes(&bytes).unwrap();
        assert!(m.payload.is_empty());
        assert_eq!(m.aux.get(0), Some(&AuxValue::I64(-2)));
    }

    #[test]
    fn reencoding_is_exact() {
        let mut aux = PrimitiveDictionary::new();
        aux.push_archived(&ArchiveValue::from("com.apple.instruments.server.services.deviceinfo"))
            .unwrap();
        let mut bytes = encode(7, 2, -1, true, MessageKind::MethodInvocation, &ping(), &aux);
        // peers may write a different buffer size hint
        LittleEndian::write_u32(&mut bytes[48..], 0x1234);

        let m = DtxMessage::from_bytes(&bytes).unwrap();
        assert_eq!(m.raw, bytes);
        assert_eq!(m.encode(), bytes);
        assert_eq!(m.header.channel_code, -1);
    }

    #[test]
    fn ack() {
        let header = MessageHeader::new(42, 0, 0, true);
        let ack = encode_ack(&header);
        assert_eq!(ack.len(), 48);
        assert_eq!(ack, encode_ack(&header));

        let m = DtxMessage::from_bytes(&ack).unwrap();
        assert_eq!(m.kind(), MessageKind::Ack);
        assert_eq!(m.header.identifier, 42);
        assert_eq!(m.header.conversation_index, 1);
        assert_eq!(m.header.message_length, 16);
        assert!(!m.header.expects_reply);
    }

    #[test]
    fn non_blocking_needs_whole_message() {
        let bytes = encode(
            3,
            0,
            0,
            false,
            MessageKind::MethodInvocation,
            &ping(),
            &PrimitiveDictionary::new(),
        );
        for cut in [2, 20, 40, bytes.len() - 1] {
            assert!(decode(&bytes[..cut]).unwrap_err().is_incomplete());
        }

        let mut two = bytes.clone();
        two.extend_from_slice(&bytes);
        let (frame, rest) = decode(&two).unwrap();
        assert_eq!(rest, &bytes[..]);
        let DtxFrame::Message(m) = frame else {
            panic!("expected a message");
        };
        assert_eq!(m.header.identifier, 3);
    }

    #[test]
    fn out_of_sync() {
        let mut bytes = encode_ack(&MessageHeader::new(1, 0, 0, true));
        bytes[0] = 0;
        assert!(matches!(decode(&bytes), Err(IdeviceError::DtxOutOfSync(_))));

        let mut bytes = encode_ack(&MessageHeader::new(1, 0, 0, true));
        LittleEndian::write_u32(&mut bytes[4..], 31);
        assert!(matches!(
            decode(&bytes),
            Err(IdeviceError::BadHeaderLength(31))
        ));
    }

    #[tokio::test]
    async fn oversized_length_is_refused_before_reading() {
        let mut header = MessageHeader::new(1, 0, 0, false);
        header.message_length = u32::MAX;
        let bytes = header.serialize();
        assert!(matches!(
            decode(&bytes),
            Err(IdeviceError::DtxMessageTooLarge(u32::MAX))
        ));

        // nothing follows the header, a read of the body would hit eof
        let mut reader = &bytes[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(IdeviceError::DtxMessageTooLarge(u32::MAX))
        ));
    }

    #[test]
    fn unknown_type_one_passes_through() {
        let body = vec![1, 2, 3];
        let bytes = encode(
            1,
            0,
            0,
            false,
            MessageKind::UnknownTypeOne,
            &body,
            &PrimitiveDictionary::new(),
        );
        let m = DtxMessage::from_bytes(&bytes).unwrap();
        assert_eq!(m.payload, vec![ArchiveValue::Data(body)]);
    }

    #[test]
    fn lz4_payload() {
        let archived = nskeyedarchive::archive(&ArchiveValue::from("compressed")).unwrap();
        let compressed = lz4_flex::block::compress(&archived);
        let mut body = (archived.len() as u32).to_le_bytes().to_vec();
        body.extend_from_slice(b"bv41");
        body.extend_from_slice(&(archived.len() as u32).to_le_bytes());
        body.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        body.extend_from_slice(&compressed);

        let bytes = encode(
            1,
            0,
            0,
            false,
            MessageKind::Lz4Compressed,
            &body,
            &PrimitiveDictionary::new(),
        );
        let m = DtxMessage::from_bytes(&bytes).unwrap();
        assert_eq!(m.payload, vec![ArchiveValue::from("compressed")]);
    }

    #[test]
    fn undecodable_payload_is_kept() {
        let bytes = encode(
            1,
            1,
            0,
            false,
            MessageKind::ResponseWithReturnValue,
            b"not an archive",
            &PrimitiveDictionary::new(),
        );
        let m = DtxMessage::from_bytes(&bytes).unwrap();
        assert!(m.payload_error.is_some());
        assert_eq!(m.payload, vec![ArchiveValue::Data(b"not an archive".to_vec())]);
    }

    #[tokio::test]
    async fn blocking_read() {
        let first = encode(
            1,
            0,
            0,
            false,
            MessageKind::MethodInvocation,
            &ping(),
            &PrimitiveDictionary::new(),
        );
        let second = encode_ack(&MessageHeader::new(2, 0, 0, true));
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut reader = &stream[..];
        let m = DtxMessage::from_reader(&mut reader).await.unwrap();
        assert_eq!(m.raw, first);
        let m = DtxMessage::from_reader(&mut reader).await.unwrap();
        assert_eq!(m.kind(), MessageKind::Ack);
        assert!(matches!(
            DtxMessage::from_reader(&mut reader).await,
            Err(IdeviceError::Socket(_))
        ));
    }
}
