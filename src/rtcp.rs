use std::convert::TryFrom;

use anyhow::{anyhow, ensure};

pub const RTCP_HEADER_SIZE: usize = 8;

const VERSION_MASK: u8 = 0b11000000;
const PADDING_MASK: u8 = 0b00100000;
const RC_MASK: u8 = 0b00011111;

/// RTCP packet type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Goodbye = 203,
    App = 204,
}

impl TryFrom<u8> for PacketKind {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            200 => Self::SenderReport,
            201 => Self::ReceiverReport,
            202 => Self::SourceDescription,
            203 => Self::Goodbye,
            204 => Self::App,
            _ => return Err(anyhow!("unknown rtcp packet type: {value}")),
        })
    }
}

/// Fixed RTCP header shared by every packet type.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |V=2|P|    RC   |       PT      |             length            |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                         SSRC of sender                        |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
pub struct RtcpHeader {
    pub version: u8,
    pub padding: bool,
    /// Reception report count. A value of zero is valid.
    pub rc: u8,
    pub kind: PacketKind,
    /// The synchronization source identifier of the packet's originator.
    pub ssrc: u32,
}

impl RtcpHeader {
    /// Total packet size derived from the length field, which counts
    /// 32-bit words minus one so that zero is a valid length.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use rtp_rx::rtcp::RtcpHeader;
    ///
    /// let buffer = [
    ///     0x80, 0xc9, 0x00, 0x01, 0x79, 0x26, 0x69, 0x55,
    /// ];
    ///
    /// assert_eq!(RtcpHeader::peek_len(&buffer), 8);
    /// ```
    pub fn peek_len(buf: &[u8]) -> usize {
        assert!(buf.len() >= 4);
        let words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        (words + 1) * 4
    }
}

impl TryFrom<&[u8]> for RtcpHeader {
    type Error = anyhow::Error;

    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        ensure!(buf.len() >= RTCP_HEADER_SIZE, "rtcp packet too short");

        let version = (buf[0] & VERSION_MASK) >> 6;
        ensure!(version == 2, "unsupported rtcp version");

        Ok(Self {
            version,
            padding: (buf[0] & PADDING_MASK) != 0,
            rc: buf[0] & RC_MASK,
            kind: PacketKind::try_from(buf[1])?,
            ssrc: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// True when the datagram looks like RTCP: version 2 and a packet type in
/// the RTCP range. Used to split RTCP traffic off a muxed socket before
/// the RTP handlers see it.
pub fn is_rtcp_packet(buf: &[u8]) -> bool {
    buf.len() >= RTCP_HEADER_SIZE
        && (buf[0] & VERSION_MASK) >> 6 == 2
        && (200..=204).contains(&buf[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sender_report_header() {
        let buffer = [
            0x80u8, 0xc8, 0x00, 0x06, 0xde, 0xad, 0xbe, 0xef,
        ];

        let header = RtcpHeader::try_from(&buffer[..]).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.kind, PacketKind::SenderReport);
        assert_eq!(header.ssrc, 0xdeadbeef);
        assert_eq!(RtcpHeader::peek_len(&buffer), 28);
    }

    #[test]
    fn rejects_non_rtcp_types() {
        let mut buffer = [0u8; RTCP_HEADER_SIZE];
        buffer[0] = 0x80;
        buffer[1] = 96;
        assert!(RtcpHeader::try_from(&buffer[..]).is_err());
        assert!(!is_rtcp_packet(&buffer));

        buffer[1] = 200;
        assert!(is_rtcp_packet(&buffer));
    }
}
