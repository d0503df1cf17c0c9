//! The message-passing substrate this crate sits on top of.
//!
//! Naming follows the `Source`/`Destination` shape common to MPI bindings:
//! `isend`/`bsend` for outbound, `iprobe`/`irecv` for inbound, `test` to poll
//! a request to completion. The real transport (whatever wraps libfabric,
//! MPI, or a TCP fabric) is an external collaborator; this crate only
//! depends on the trait below plus the in-process [`mock`] implementation
//! used by its own tests.

/// What `iprobe` reports about a message waiting to be received.
#[derive(Debug, Clone, Copy)]
pub struct ProbeStatus {
    pub source_rank: i32,
    pub tag: u32,
    pub size: usize,
}

/// A posted, not-yet-complete send.
pub trait SendHandle: Send {
    /// Non-blocking completion check.
    fn test(&mut self) -> bool;
}

/// A posted, not-yet-complete receive.
pub trait RecvHandle: Send {
    /// Non-blocking completion check; returns the payload once complete.
    fn test(&mut self) -> Option<Vec<u8>>;
    fn source_rank(&self) -> i32;
    fn tag(&self) -> u32;
}

/// The transport contract this crate consumes: a fixed-size, rank-addressed
/// communicator with non-blocking point-to-point operations and FIFO
/// ordering per `(source, dest, tag)`.
pub trait Transport: Send + Sync {
    fn size(&self) -> i32;
    fn rank(&self) -> i32;
    /// Non-blocking send; ownership of `bytes` transfers to the request.
    fn isend(&self, bytes: Vec<u8>, dst: i32, tag: u32) -> Box<dyn SendHandle>;
    /// Buffered send; locally complete on return (used for small control
    /// messages, matching the FOC protocol's `bsend` in spec terms).
    fn bsend(&self, bytes: &[u8], dst: i32, tag: u32);
    /// Non-blocking probe for the next incoming message, if any.
    fn iprobe(&self) -> Option<ProbeStatus>;
    /// Non-blocking receive of a message already reported by `iprobe`.
    fn irecv(&self, size: usize, src: i32, tag: u32) -> Box<dyn RecvHandle>;
}

/// In-process mock transport, wiring every rank's endpoint to every other
/// rank's inbox via `std::sync::mpsc`. Stands in for the real substrate in
/// this crate's own tests.
pub mod mock {
    use super::{ProbeStatus, RecvHandle, SendHandle, Transport};
    use std::sync::{mpsc, Mutex};

    struct WireMessage {
        source_rank: i32,
        tag: u32,
        bytes: Vec<u8>,
    }

    /// Builds a fully-connected set of [`MockTransport`] endpoints, one per
    /// rank, for use within a single process.
    #[must_use]
    pub fn build_world(size: i32) -> Vec<MockTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| mpsc::channel::<WireMessage>())
            .unzip();

        let mut receivers = receivers.into_iter();
        (0..size)
            .map(|rank| MockTransport {
                rank,
                size,
                senders: senders.clone(),
                state: Mutex::new(MockState {
                    inbox: receivers.next().expect("one receiver per rank"),
                    pending: None,
                }),
            })
            .collect()
    }

    /// `mpsc::Receiver` is `Send` but not `Sync`, and `SendProgress`'s and
    /// `RecvProgress`'s threads share one `Arc<dyn Transport>`, so the inbox
    /// and its single-slot probe buffer live behind one mutex rather than
    /// as separate fields.
    struct MockState {
        inbox: mpsc::Receiver<WireMessage>,
        pending: Option<WireMessage>,
    }

    pub struct MockTransport {
        rank: i32,
        size: i32,
        senders: Vec<mpsc::Sender<WireMessage>>,
        state: Mutex<MockState>,
    }

    struct MockSendHandle;

    impl SendHandle for MockSendHandle {
        fn test(&mut self) -> bool {
            // Sent synchronously into the target's channel at post time.
            true
        }
    }

    struct MockRecvHandle {
        source_rank: i32,
        tag: u32,
        bytes: Option<Vec<u8>>,
    }

    impl RecvHandle for MockRecvHandle {
        fn test(&mut self) -> Option<Vec<u8>> {
            self.bytes.take()
        }

        fn source_rank(&self) -> i32 {
            self.source_rank
        }

        fn tag(&self) -> u32 {
            self.tag
        }
    }

    impl Transport for MockTransport {
        fn size(&self) -> i32 {
            self.size
        }

        fn rank(&self) -> i32 {
            self.rank
        }

        fn isend(&self, bytes: Vec<u8>, dst: i32, tag: u32) -> Box<dyn SendHandle> {
            let msg = WireMessage {
                source_rank: self.rank,
                tag,
                bytes,
            };
            self.senders[dst as usize]
                .send(msg)
                .expect("mock transport peer endpoint dropped");
            Box::new(MockSendHandle)
        }

        fn bsend(&self, bytes: &[u8], dst: i32, tag: u32) {
            let msg = WireMessage {
                source_rank: self.rank,
                tag,
                bytes: bytes.to_vec(),
            };
            self.senders[dst as usize]
                .send(msg)
                .expect("mock transport peer endpoint dropped");
        }

        fn iprobe(&self) -> Option<ProbeStatus> {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.pending.is_none() {
                if let Ok(msg) = state.inbox.try_recv() {
                    state.pending = Some(msg);
                }
            }
            state.pending.as_ref().map(|msg| ProbeStatus {
                source_rank: msg.source_rank,
                tag: msg.tag,
                size: msg.bytes.len(),
            })
        }

        fn irecv(&self, _size: usize, _src: i32, _tag: u32) -> Box<dyn RecvHandle> {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let msg = state
                .pending
                .take()
                .expect("irecv called without a prior successful iprobe");
            Box::new(MockRecvHandle {
                source_rank: msg.source_rank,
                tag: msg.tag,
                bytes: Some(msg.bytes),
            })
        }
    }
}
