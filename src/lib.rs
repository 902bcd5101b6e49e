//! ## Real-time media transport reception
//!
//! [RFC 3550]: https://tools.ietf.org/html/rfc3550
//! [RFC 3711]: https://tools.ietf.org/html/rfc3711
//!
//! This crate is the receiving half of an RTP stack: it moves UDP
//! datagrams from a socket through a chain of packet handlers into either
//! a pull queue or a push callback, with SRTCP protection available for
//! the RTCP control traffic travelling alongside the media.
//!
//! Reception runs on two dedicated threads. A receiver thread polls the
//! socket and copies datagrams into a ring buffer that grows under
//! back-pressure instead of dropping traffic, so a processing hiccup
//! costs latency rather than packets. A processor thread drains the ring
//! and walks each datagram through the installed handlers, which classify
//! it, parse it into a frame, or feed it to payload-specific reassembly;
//! frames the handlers emit are handed to the application through the
//! delivery endpoint of [`ReceptionFlow`].
//!
//! ```no_run
//! use rtp_rx::{PacketStatus, ReceptionFlow, Socket};
//!
//! let flow = ReceptionFlow::new();
//!
//! let key = flow.install_handler(rtp_rx::rtp_handler());
//! flow.install_aux_handler_fn(
//!     key,
//!     |_flags, _frame| PacketStatus::Ready,
//!     |_frame| PacketStatus::Handled,
//! )?;
//!
//! flow.start(Socket::bind("0.0.0.0:5004".parse()?)?, 0)?;
//! let frame = flow.pull_frame();
//! flow.stop();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod error;
pub mod flow;
pub mod frame;
pub mod handler;
mod ring;
pub mod rtcp;
pub mod socket;
pub mod srtp;

pub use self::{
    error::Error,
    flow::{ReceptionFlow, DEFAULT_BUFFER_SIZE},
    frame::{rtp_handler, RtpFrame, RTP_HEADER_SIZE},
    handler::PacketStatus,
    socket::Socket,
    srtp::{KeyContext, SessionKeys, Srtcp, SrtpError},
};
