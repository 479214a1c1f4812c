//! usbmuxd packet framing
//!
//! ```text
//! +--------+---------+--------------+-----+----------------+
//! | length | version | message type | tag | XML plist body |
//! +--------+---------+--------------+-----+----------------+
//!   u32 LE   u32 LE     u32 LE       u32 LE
//! ```
//! `length` counts the 16 header bytes too.

use crate::IdeviceError;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

/// Header fields of a packet, decoded before its body is read
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketHeader {
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl RawPacket {
    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            version,
            message,
            tag,
            plist,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IdeviceError> {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &self.plist)?;

        let mut res = Vec::with_capacity(HEADER_LEN + body.len());
        res.extend_from_slice(&((HEADER_LEN + body.len()) as u32).to_le_bytes());
        res.extend_from_slice(&self.version.to_le_bytes());
        res.extend_from_slice(&self.message.to_le_bytes());
        res.extend_from_slice(&self.tag.to_le_bytes());
        res.extend_from_slice(&body);
        Ok(res)
    }
}

impl PacketHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, IdeviceError> {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let header = Self {
            size: word(0),
            version: word(4),
            message: word(8),
            tag: word(12),
        };
        if (header.size as usize) < HEADER_LEN {
            return Err(IdeviceError::NotEnoughBytes(header.size as usize, HEADER_LEN));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_includes_header() {
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        let bytes = RawPacket::new(dict, 1, 8, 7).to_bytes().unwrap();

        let header: [u8; HEADER_LEN] = bytes[..HEADER_LEN].try_into().unwrap();
        let header = PacketHeader::parse(&header).unwrap();
        assert_eq!(header.size as usize, bytes.len());
        assert_eq!((header.version, header.message, header.tag), (1, 8, 7));
        let body: plist::Dictionary = plist::from_bytes(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(
            body.get("MessageType").and_then(|v| v.as_string()),
            Some("ListDevices")
        );
    }

    #[test]
    fn short_size_is_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = 4;
        assert!(PacketHeader::parse(&buf).is_err());
    }
}
