// usbmuxd frame: 16 byte little-endian header followed by a plist

use crate::IdeviceError;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPacketHeader {
    /// Total frame length, header included
    pub length: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl RawPacketHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            length: word(0),
            version: word(4),
            message: word(8),
            tag: word(12),
        }
    }

    /// Number of plist bytes that follow the header
    pub fn body_len(&self) -> Result<usize, IdeviceError> {
        (self.length as usize)
            .checked_sub(HEADER_LEN)
            .ok_or(IdeviceError::NotEnoughBytes(self.length as usize, HEADER_LEN))
    }
}

pub struct RawPacket {
    header: RawPacketHeader,
    plist: Vec<u8>,
}

impl RawPacket {
    pub fn new(
        plist: plist::Dictionary,
        version: u32,
        message: u32,
        tag: u32,
    ) -> Result<Self, IdeviceError> {
        let mut body = Vec::new();
        plist::Value::Dictionary(plist).to_writer_xml(&mut body)?;
        Ok(Self {
            header: RawPacketHeader {
                length: (body.len() + HEADER_LEN) as u32,
                version,
                message,
                tag,
            },
            plist: body,
        })
    }
}

impl From<RawPacket> for Vec<u8> {
    fn from(raw: RawPacket) -> Self {
        let mut out = Vec::with_capacity(raw.header.length as usize);
        out.extend_from_slice(&raw.header.length.to_le_bytes());
        out.extend_from_slice(&raw.header.version.to_le_bytes());
        out.extend_from_slice(&raw.header.message.to_le_bytes());
        out.extend_from_slice(&raw.header.tag.to_le_bytes());
        out.extend(raw.plist);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        let bytes: Vec<u8> = RawPacket::new(req, 1, 8, 7).unwrap().into();

        let header = RawPacketHeader::parse(bytes[..HEADER_LEN].try_into().unwrap());
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.version, 1);
        assert_eq!(header.message, 8);
        assert_eq!(header.tag, 7);
        assert_eq!(header.body_len().unwrap(), bytes.len() - HEADER_LEN);
    }

    #[test]
    fn short_length_is_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = 4;
        assert!(RawPacketHeader::parse(&buf).body_len().is_err());
    }
}
