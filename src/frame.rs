use std::convert::TryFrom;

use anyhow::ensure;
use bytes::Bytes;

use crate::handler::{PacketStatus, PrimaryHandler};

pub const RTP_HEADER_SIZE: usize = 12;

const VERSION_MASK: u8 = 0b11000000;
const PADDING_MASK: u8 = 0b00100000;
const EXTENSION_MASK: u8 = 0b00010000;
const CSRC_COUNT_MASK: u8 = 0b00001111;
const MARKER_MASK: u8 = 0b10000000;
const PAYLOAD_KIND_MASK: u8 = 0b01111111;

/// Parsed RTP packet as produced by the reception pipeline.
///
/// ### RTP Fixed Header Fields
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |V=2|P|X|  CC   |M|     PT      |       sequence number         |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                           timestamp                           |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |           synchronization source (SSRC) identifier            |
///  +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
///  |            contributing source (CSRC) identifiers             |
///  |                             ....                              |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ownership transfers with the frame: once a frame reaches the pull queue
/// or a receive hook, the consumer owns it outright.
#[derive(Debug, Clone)]
pub struct RtpFrame {
    /// If the padding bit is set, the packet contains one or more
    /// additional padding octets at the end which are not part of the
    /// payload.
    pub padding: bool,
    /// If the extension bit is set, the fixed header is followed by
    /// exactly one header extension.
    pub extension: bool,
    /// The interpretation of the marker is defined by a profile. It is
    /// intended to allow significant events such as frame boundaries to
    /// be marked in the packet stream.
    pub marker: bool,
    /// This field identifies the format of the RTP payload and determines
    /// its interpretation by the application.
    pub payload_kind: u8,
    /// The sequence number increments by one for each RTP data packet
    /// sent, and may be used by the receiver to detect packet loss and to
    /// restore packet sequence.
    pub sequence_number: u16,
    /// The timestamp reflects the sampling instant of the first octet in
    /// the RTP data packet.
    pub timestamp: u32,
    /// The SSRC field identifies the synchronization source.
    pub ssrc: u32,
    /// The CSRC list identifies the contributing sources for the payload
    /// contained in this packet.
    pub csrc: Vec<u32>,
    pub payload: Bytes,
}

impl TryFrom<&[u8]> for RtpFrame {
    type Error = anyhow::Error;

    /// # Unit Test
    ///
    /// ```
    /// use std::convert::TryFrom;
    /// use rtp_rx::RtpFrame;
    ///
    /// let buffer = [
    ///     0x80u8, 0x60, 0x00, 0x01, 0x12, 0x34, 0x56, 0x78,
    ///     0xde, 0xad, 0xbe, 0xef, 0x11, 0x22,
    /// ];
    ///
    /// let frame = RtpFrame::try_from(&buffer[..]).unwrap();
    /// assert_eq!(frame.payload_kind, 96);
    /// assert_eq!(frame.sequence_number, 1);
    /// assert_eq!(frame.timestamp, 0x12345678);
    /// assert_eq!(frame.ssrc, 0xdeadbeef);
    /// assert_eq!(frame.payload.as_ref(), &[0x11, 0x22]);
    /// ```
    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        ensure!(buf.len() >= RTP_HEADER_SIZE, "rtp packet too short");
        ensure!((buf[0] & VERSION_MASK) >> 6 == 2, "unsupported rtp version");

        let padding = (buf[0] & PADDING_MASK) != 0;
        let extension = (buf[0] & EXTENSION_MASK) != 0;
        let csrc_count = (buf[0] & CSRC_COUNT_MASK) as usize;
        let marker = (buf[1] & MARKER_MASK) != 0;
        let payload_kind = buf[1] & PAYLOAD_KIND_MASK;
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let mut offset = RTP_HEADER_SIZE;
        ensure!(buf.len() >= offset + csrc_count * 4, "truncated csrc list");

        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(u32::from_be_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]));
            offset += 4;
        }

        if extension {
            ensure!(buf.len() >= offset + 4, "truncated extension header");

            // Extension length counts 32-bit words and excludes the 4-byte
            // extension header itself.
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + words * 4;
            ensure!(buf.len() >= offset, "truncated extension payload");
        }

        Ok(Self {
            padding,
            extension,
            marker,
            payload_kind,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            payload: Bytes::copy_from_slice(&buf[offset..]),
        })
    }
}

/// Ready-made primary handler that claims RTP datagrams.
///
/// Anything that is not RTP (too short, wrong version) is passed over with
/// [`PacketStatus::NotHandled`] so other primaries can look at it. A
/// datagram that looks like RTP but fails to parse is reported as
/// [`PacketStatus::Failed`]; well-formed packets are parsed into an
/// [`RtpFrame`] and handed to the auxiliary chain.
pub fn rtp_handler() -> PrimaryHandler {
    Box::new(|data, _flags, out| {
        if data.len() < RTP_HEADER_SIZE || (data[0] & VERSION_MASK) >> 6 != 2 {
            return PacketStatus::NotHandled;
        }

        match RtpFrame::try_from(data) {
            Ok(frame) => {
                out.replace(frame);
                PacketStatus::Modified
            }
            Err(err) => {
                log::debug!("dropping malformed rtp packet: {err}");
                PacketStatus::Failed
            }
        }
    })
}
