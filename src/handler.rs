use crate::error::Error;
use crate::frame::RtpFrame;

/// Outcome of one packet handler invocation.
///
/// Primaries report whether they consumed, skipped, or parsed a datagram;
/// auxiliaries additionally report frames becoming ready for delivery.
/// Handler outcomes are always local: a failing handler is logged and the
/// chain moves on, nothing propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// The packet was consumed without producing a frame.
    Handled,
    /// The packet does not belong to this handler; try the next one.
    NotHandled,
    /// A primary handler parsed the packet into a frame and its auxiliary
    /// chain should run.
    Modified,
    /// A frame is ready for delivery.
    Ready,
    /// The handler buffered several frames; drain them through the getter.
    MultipleReady,
    /// The packet was corrupted or otherwise unusable.
    Failed,
}

pub type PrimaryHandler =
    Box<dyn FnMut(&[u8], i32, &mut Option<RtpFrame>) -> PacketStatus + Send>;
pub type AuxHandler = Box<dyn FnMut(i32, &mut Option<RtpFrame>) -> PacketStatus + Send>;
pub type FrameGetter = Box<dyn FnMut(&mut Option<RtpFrame>) -> PacketStatus + Send>;

struct Auxiliary {
    handler: AuxHandler,
    getter: FrameGetter,
}

struct Entry {
    key: u32,
    primary: PrimaryHandler,
    auxiliary: Vec<Auxiliary>,
}

/// Keyed set of primary handlers, each carrying an ordered auxiliary chain.
///
/// Primaries run in installation order against every datagram; when one of
/// them reports [`PacketStatus::Modified`] its auxiliaries run, also in
/// installation order. Keys are random, non-zero, and unique for the
/// lifetime of the registry; handlers are never removed individually.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    entries: Vec<Entry>,
}

impl HandlerRegistry {
    /// Register a primary handler and return its key.
    pub fn install(&mut self, primary: PrimaryHandler) -> u32 {
        let mut key = rand::random::<u32>();
        while key == 0 || self.contains(key) {
            key = rand::random();
        }

        self.entries.push(Entry {
            key,
            primary,
            auxiliary: Vec::new(),
        });
        key
    }

    /// Append an auxiliary handler to the primary identified by `key`.
    pub fn install_aux(
        &mut self,
        key: u32,
        handler: AuxHandler,
        getter: FrameGetter,
    ) -> Result<(), Error> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.key == key)
            .ok_or(Error::InvalidValue)?;

        entry.auxiliary.push(Auxiliary { handler, getter });
        Ok(())
    }

    fn contains(&self, key: u32) -> bool {
        self.entries.iter().any(|entry| entry.key == key)
    }

    /// Run one datagram through every primary handler, forwarding frames
    /// that become ready to `deliver`.
    pub fn dispatch(&mut self, data: &[u8], flags: i32, deliver: &mut dyn FnMut(RtpFrame)) {
        for entry in self.entries.iter_mut() {
            let mut frame = None;

            match (entry.primary)(data, flags, &mut frame) {
                // Consumed without a frame; the auxiliary chain stays idle.
                PacketStatus::Handled => {}
                PacketStatus::NotHandled => continue,
                PacketStatus::Modified => {
                    Self::dispatch_aux(&mut entry.auxiliary, flags, frame, deliver)
                }
                PacketStatus::Failed => {
                    log::debug!("received a corrupted packet");
                }
                status => {
                    log::error!("unexpected status from a primary handler: {:?}", status);
                }
            }
        }
    }

    fn dispatch_aux(
        chain: &mut [Auxiliary],
        flags: i32,
        mut frame: Option<RtpFrame>,
        deliver: &mut dyn FnMut(RtpFrame),
    ) {
        for aux in chain.iter_mut() {
            match (aux.handler)(flags, &mut frame) {
                PacketStatus::Handled => {}
                PacketStatus::Ready => {
                    if let Some(ready) = frame.take() {
                        deliver(ready);
                    }
                }
                PacketStatus::MultipleReady => {
                    while (aux.getter)(&mut frame) == PacketStatus::Ready {
                        if let Some(ready) = frame.take() {
                            deliver(ready);
                        }
                    }
                }
                PacketStatus::NotHandled | PacketStatus::Modified => continue,
                PacketStatus::Failed => {
                    log::debug!("received a corrupted packet");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;

    fn frame(seq: u16) -> RtpFrame {
        RtpFrame {
            padding: false,
            extension: false,
            marker: false,
            payload_kind: 96,
            sequence_number: seq,
            timestamp: 0,
            ssrc: 0x1234,
            csrc: Vec::new(),
            payload: Bytes::from_static(b"x"),
        }
    }

    fn noop_getter() -> FrameGetter {
        Box::new(|_| PacketStatus::Handled)
    }

    #[test]
    fn keys_are_unique_and_non_zero() {
        let mut registry = HandlerRegistry::default();
        let mut keys = Vec::new();

        for _ in 0..64 {
            keys.push(registry.install(Box::new(|_, _, _| PacketStatus::NotHandled)));
        }

        for (i, key) in keys.iter().enumerate() {
            assert_ne!(*key, 0);
            assert!(!keys[i + 1..].contains(key));
        }
    }

    #[test]
    fn unknown_key_rejects_auxiliary_install() {
        let mut registry = HandlerRegistry::default();
        let result = registry.install_aux(
            42,
            Box::new(|_, _| PacketStatus::Handled),
            noop_getter(),
        );
        assert!(matches!(result, Err(Error::InvalidValue)));
    }

    #[test]
    fn primaries_run_in_installation_order() {
        let mut registry = HandlerRegistry::default();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for tag in 0..4u8 {
            let order = order.clone();
            registry.install(Box::new(move |_, _, _| {
                order.lock().push(tag);
                PacketStatus::NotHandled
            }));
        }

        registry.dispatch(b"datagram", 0, &mut |_| {});
        assert_eq!(order.lock().as_slice(), &[0, 1, 2, 3]);
    }

    #[test]
    fn modified_dispatches_auxiliaries_in_order() {
        let mut registry = HandlerRegistry::default();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let key = registry.install(Box::new(|_, _, out| {
            out.replace(frame(1));
            PacketStatus::Modified
        }));

        for tag in 0..3u8 {
            let order = order.clone();
            registry
                .install_aux(
                    key,
                    Box::new(move |_, _| {
                        order.lock().push(tag);
                        PacketStatus::NotHandled
                    }),
                    noop_getter(),
                )
                .unwrap();
        }

        registry.dispatch(b"datagram", 0, &mut |_| {});
        assert_eq!(order.lock().as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn handled_primary_keeps_auxiliaries_idle() {
        let mut registry = HandlerRegistry::default();
        let aux_runs = Arc::new(AtomicUsize::new(0));

        let key = registry.install(Box::new(|_, _, _| PacketStatus::Handled));
        let counter = aux_runs.clone();
        registry
            .install_aux(
                key,
                Box::new(move |_, _| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    PacketStatus::Handled
                }),
                noop_getter(),
            )
            .unwrap();

        registry.dispatch(b"datagram", 0, &mut |_| {});
        assert_eq!(aux_runs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn ready_delivers_one_frame() {
        let mut registry = HandlerRegistry::default();

        let key = registry.install(Box::new(|_, _, out| {
            out.replace(frame(7));
            PacketStatus::Modified
        }));
        registry
            .install_aux(key, Box::new(|_, _| PacketStatus::Ready), noop_getter())
            .unwrap();

        let mut delivered = Vec::new();
        registry.dispatch(b"datagram", 0, &mut |f| delivered.push(f));

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].sequence_number, 7);
    }

    #[test]
    fn getter_drains_multiple_frames() {
        let mut registry = HandlerRegistry::default();

        let key = registry.install(Box::new(|_, _, out| {
            out.replace(frame(0));
            PacketStatus::Modified
        }));

        let mut remaining = 5u16;
        registry
            .install_aux(
                key,
                Box::new(|_, _| PacketStatus::MultipleReady),
                Box::new(move |out| {
                    if remaining == 0 {
                        return PacketStatus::Handled;
                    }
                    remaining -= 1;
                    out.replace(frame(remaining));
                    PacketStatus::Ready
                }),
            )
            .unwrap();

        let mut delivered = Vec::new();
        registry.dispatch(b"datagram", 0, &mut |f| delivered.push(f));

        let sequences: Vec<u16> = delivered.iter().map(|f| f.sequence_number).collect();
        assert_eq!(sequences, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn flags_are_forwarded_verbatim() {
        let mut registry = HandlerRegistry::default();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        registry.install(Box::new(move |_, flags, _| {
            counter.store(flags as usize, Ordering::Relaxed);
            PacketStatus::Handled
        }));

        registry.dispatch(b"datagram", 0x55, &mut |_| {});
        assert_eq!(seen.load(Ordering::Relaxed), 0x55);
    }
}
