use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::frame::RtpFrame;
use crate::handler::{AuxHandler, FrameGetter, HandlerRegistry, PacketStatus};
use crate::ring::RingBuffer;
use crate::socket::Socket;

/// Initial ring capacity in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// How long the receiver waits for readability before rechecking shutdown.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Polling granularity of the blocking pull.
const PULL_INTERVAL: Duration = Duration::from_millis(5);
/// Polling granularity of the bounded pull, finer so short timeouts stay
/// meaningful.
const PULL_TIMEOUT_INTERVAL: Duration = Duration::from_millis(1);

pub type ReceiveHook = Box<dyn FnMut(RtpFrame) + Send>;

struct Shared {
    ring: RingBuffer,
    handlers: Mutex<HandlerRegistry>,
    frames: Mutex<VecDeque<RtpFrame>>,
    hook: Mutex<Option<ReceiveHook>>,
    should_stop: AtomicBool,
    process_pending: Mutex<bool>,
    process_cond: Condvar,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    /// Wake the processor. The flag makes the signal sticky so a round
    /// that completes while the processor is still draining the previous
    /// one is not lost.
    fn signal_processor(&self) {
        *self.process_pending.lock() = true;
        self.process_cond.notify_one();
    }

    /// Hand a frame to the delivery endpoint: the receive hook when one is
    /// installed, the pull queue otherwise. The callee owns the frame
    /// from here on.
    fn deliver(&self, frame: RtpFrame) {
        let mut hook = self.hook.lock();
        if let Some(hook) = hook.as_mut() {
            hook(frame);
        } else {
            drop(hook);
            self.frames.lock().push_back(frame);
        }
    }
}

/// Packet ingress pipeline for one socket.
///
/// Two threads move datagrams from the socket to the application. The
/// receiver polls the socket and writes raw datagrams into a ring buffer,
/// growing it rather than dropping traffic when the processor falls
/// behind. The processor drains the ring and pushes each datagram through
/// the installed handler chain; frames the handlers produce are either
/// queued for [`ReceptionFlow::pull_frame`] or delivered synchronously to
/// the hook installed with [`ReceptionFlow::install_receive_hook`].
///
/// ```no_run
/// use rtp_rx::{PacketStatus, ReceptionFlow, Socket};
///
/// let flow = ReceptionFlow::new();
/// let key = flow.install_handler(rtp_rx::rtp_handler());
/// flow.install_aux_handler_fn(
///     key,
///     |_flags, _frame| PacketStatus::Ready,
///     |_frame| PacketStatus::Handled,
/// )?;
///
/// flow.start(Socket::bind("0.0.0.0:5004".parse()?)?, 0)?;
/// while let Some(frame) = flow.pull_frame() {
///     println!("seq={}", frame.sequence_number);
/// }
/// flow.stop();
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct ReceptionFlow {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl ReceptionFlow {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create a flow whose ring starts at `bytes` of slot capacity.
    pub fn with_buffer_size(bytes: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                ring: RingBuffer::new(bytes),
                handlers: Mutex::new(HandlerRegistry::default()),
                frames: Mutex::new(VecDeque::new()),
                hook: Mutex::new(None),
                should_stop: AtomicBool::new(true),
                process_pending: Mutex::new(false),
                process_cond: Condvar::new(),
            }),
            receiver: Mutex::new(None),
            processor: Mutex::new(None),
        }
    }

    pub fn running(&self) -> bool {
        self.receiver.lock().is_some() || self.processor.lock().is_some()
    }

    /// Replace the ring with a fresh one of `bytes` capacity, discarding
    /// anything buffered. Only valid while the flow is stopped.
    pub fn set_buffer_size(&self, bytes: usize) -> Result<(), Error> {
        if self.running() {
            return Err(Error::Running);
        }

        self.shared.ring.resize(bytes);
        Ok(())
    }

    /// Current number of ring slots. Grows under back-pressure.
    pub fn ring_slot_count(&self) -> usize {
        self.shared.ring.slot_count()
    }

    /// Register a primary packet handler and return its key. Handlers run
    /// on the processor thread in installation order; installing while the
    /// flow is running is allowed and takes effect on the next drain.
    pub fn install_handler<H>(&self, handler: H) -> u32
    where
        H: FnMut(&[u8], i32, &mut Option<RtpFrame>) -> PacketStatus + Send + 'static,
    {
        self.shared.handlers.lock().install(Box::new(handler))
    }

    /// Append a context-carrying auxiliary handler to the primary
    /// identified by `key`. The handler and getter share the context, so
    /// multi-frame output can be staged in it between the two calls.
    pub fn install_aux_handler<C>(
        &self,
        key: u32,
        ctx: Arc<Mutex<C>>,
        handler: fn(&mut C, i32, &mut Option<RtpFrame>) -> PacketStatus,
        getter: fn(&mut C, &mut Option<RtpFrame>) -> PacketStatus,
    ) -> Result<(), Error>
    where
        C: Send + 'static,
    {
        let handler_ctx = ctx.clone();
        let boxed_handler: AuxHandler =
            Box::new(move |flags, frame| handler(&mut handler_ctx.lock(), flags, frame));
        let boxed_getter: FrameGetter = Box::new(move |frame| getter(&mut ctx.lock(), frame));

        self.shared
            .handlers
            .lock()
            .install_aux(key, boxed_handler, boxed_getter)
    }

    /// Closure flavor of [`ReceptionFlow::install_aux_handler`].
    pub fn install_aux_handler_fn<H, G>(&self, key: u32, handler: H, getter: G) -> Result<(), Error>
    where
        H: FnMut(i32, &mut Option<RtpFrame>) -> PacketStatus + Send + 'static,
        G: FnMut(&mut Option<RtpFrame>) -> PacketStatus + Send + 'static,
    {
        self.shared
            .handlers
            .lock()
            .install_aux(key, Box::new(handler), Box::new(getter))
    }

    /// Switch the delivery endpoint to push mode. Every frame the handlers
    /// produce is passed to `hook` synchronously on the processor thread
    /// and the pull queue stays empty. Install the hook before the first
    /// frame is delivered; the delivery mode is not meant to change within
    /// a session.
    pub fn install_receive_hook<F>(&self, hook: F)
    where
        F: FnMut(RtpFrame) + Send + 'static,
    {
        *self.shared.hook.lock() = Some(Box::new(hook));
    }

    /// Block until a frame is available and take it, or return `None` once
    /// shutdown is requested. Polls the queue rather than parking on the
    /// processor, so it never contends with the ring.
    pub fn pull_frame(&self) -> Option<RtpFrame> {
        loop {
            if self.shared.stopping() {
                return None;
            }

            if let Some(frame) = self.shared.frames.lock().pop_front() {
                return Some(frame);
            }

            thread::sleep(PULL_INTERVAL);
        }
    }

    /// Bounded [`ReceptionFlow::pull_frame`]: additionally returns `None`
    /// when `timeout` elapses without a frame showing up.
    pub fn pull_frame_timeout(&self, timeout: Duration) -> Option<RtpFrame> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.shared.stopping() {
                return None;
            }

            if let Some(frame) = self.shared.frames.lock().pop_front() {
                return Some(frame);
            }

            if Instant::now() >= deadline {
                return None;
            }

            thread::sleep(PULL_TIMEOUT_INTERVAL);
        }
    }

    /// Spawn the receiver and processor threads. `flags` is opaque to the
    /// flow and forwarded verbatim to every handler invocation.
    pub fn start(&self, socket: Socket, flags: i32) -> Result<(), Error> {
        let mut receiver = self.receiver.lock();
        let mut processor = self.processor.lock();
        if receiver.is_some() || processor.is_some() {
            return Err(Error::Running);
        }

        self.shared.should_stop.store(false, Ordering::Release);
        *self.shared.process_pending.lock() = false;

        let shared = self.shared.clone();
        *processor = Some(
            thread::Builder::new()
                .name("rtp-processor".into())
                .spawn(move || processor_loop(shared, flags))?,
        );

        let shared = self.shared.clone();
        *receiver = Some(
            thread::Builder::new()
                .name("rtp-receiver".into())
                .spawn(move || receiver_loop(shared, socket))?,
        );

        Ok(())
    }

    /// Request shutdown, wake the processor, join both threads, and clear
    /// any frames still queued for pulling. Safe to call repeatedly.
    pub fn stop(&self) {
        self.shared.request_stop();
        self.shared.signal_processor();

        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.processor.lock().take() {
            let _ = handle.join();
        }

        self.shared.frames.lock().clear();
    }
}

impl Default for ReceptionFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReceptionFlow {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receiver_loop(shared: Arc<Shared>, socket: Socket) {
    log::debug!("reception loop started");
    request_realtime_priority("receiver", 0);

    while !shared.stopping() {
        match socket.wait_readable(POLL_TIMEOUT) {
            // Timeout; loop around and recheck shutdown.
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                log::error!("socket poll failed, reception cannot continue: {err}");
                shared.request_stop();
                break;
            }
        }

        // Drain the kernel queue into successive ring slots. The write
        // cursor is published per datagram, after the slot is complete.
        let mut received = false;
        while !shared.stopping() {
            if shared.ring.write_would_overrun() {
                log::debug!("reception ring ran out of slots, growing the buffer");
                shared.ring.grow();
            }

            match shared.ring.produce_with(|buf| socket.recv_into(buf)) {
                Ok(Some(size)) => {
                    log::trace!("udp datagram buffered: size={size}");
                    received = true;
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("recvfrom failed, reception cannot continue: {err}");
                    shared.request_stop();
                    break;
                }
            }
        }

        if received {
            shared.signal_processor();
        }
    }

    // A fatal exit must not leave the processor parked on the condvar.
    shared.signal_processor();
    log::debug!("reception loop exited");
}

fn processor_loop(shared: Arc<Shared>, flags: i32) {
    log::debug!("processing loop started");
    request_realtime_priority("processor", 1);

    loop {
        {
            let mut pending = shared.process_pending.lock();
            while !*pending && !shared.stopping() {
                shared.process_cond.wait(&mut pending);
            }

            if shared.stopping() {
                break;
            }
            *pending = false;
        }

        // The drain holds the ring's growth lock, so the receiver can only
        // grow the ring between drains. The registry lock is taken per
        // datagram, which is what lets handlers be installed mid-flight.
        shared.ring.drain(|datagram| {
            shared
                .handlers
                .lock()
                .dispatch(datagram, flags, &mut |frame| shared.deliver(frame));
        });
    }

    log::debug!("processing loop exited");
}

/// Ask the scheduler for real-time priority for the calling thread,
/// `below_max` steps under the maximum. Advisory: on most hosts this needs
/// privileges, so failure is logged and ignored.
#[cfg(unix)]
fn request_realtime_priority(name: &str, below_max: i32) {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            log::debug!("{name}: no realtime priority range available");
            return;
        }

        let param = libc::sched_param {
            sched_priority: max - below_max,
        };
        let ret = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if ret != 0 {
            log::debug!(
                "{name}: realtime priority not granted: {}",
                std::io::Error::from_raw_os_error(ret)
            );
        }
    }
}

#[cfg(not(unix))]
fn request_realtime_priority(_name: &str, _below_max: i32) {}
