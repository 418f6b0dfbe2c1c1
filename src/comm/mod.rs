//! Communication abstraction for in-process (thread) and inter-process
//! (MPI) message passing.
//!
//! Wire conventions for higher-level protocols:
//! - All multi-byte integers are little-endian fixed width.
//! - Every logical message is framed: an 8-byte length on the size
//!   companion tag, then the payload on the data tag (see [`peer`]).
//! - Receivers size buffers from the length message; payloads are never
//!   truncated.

pub mod peer;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking completion test.
pub trait PollWait {
    /// Return `Some(bytes)` if the operation has completed, otherwise
    /// `None`. Completion is observed at most once.
    fn try_wait(&mut self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait + Send;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait + PollWait + Send;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, recv_len: usize) -> Self::RecvHandle;

    /// Rank of this process (0..size-1).
    fn rank(&self) -> usize;
    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Synchronization barrier (default: no-op for serial comms).
    fn barrier(&self) {}

    /// Undelivered messages addressed to this rank, when the backend can
    /// observe them. Used for stray-traffic sanity checks.
    fn pending_message_count(&self) -> Option<usize> {
        None
    }
}

/// Tag newtype for safer tag arithmetic.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommTag(u16);

impl CommTag {
    #[inline]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Offset the tag by `dx`, wrapping on overflow.
    #[inline]
    pub const fn offset(self, dx: u16) -> Self {
        Self(self.0.wrapping_add(dx))
    }
}

/// Message tags isolating the protocol phases. The size companion of a
/// data tag lives at a fixed offset so phases never share a channel.
pub mod tags {
    use super::CommTag;

    /// Up-pass work messages.
    pub const LOAD_UP: CommTag = CommTag::new(1);
    /// Down-pass work messages.
    pub const LOAD_DOWN: CommTag = CommTag::new(2);
    /// Mapping-reconstruction sweep toward the root.
    pub const EDGE_UP: CommTag = CommTag::new(3);
    /// Mapping-reconstruction sweep away from the root.
    pub const EDGE_DOWN: CommTag = CommTag::new(4);
    /// Pre-balance moves into the rank group (toward members).
    pub const PREBALANCE_UP: CommTag = CommTag::new(5);
    /// Pre-balance acknowledgements / reserved.
    pub const PREBALANCE_DOWN: CommTag = CommTag::new(6);
    /// Load-sum sweep toward the root.
    pub const REDUCE_UP: CommTag = CommTag::new(7);
    /// Load-average broadcast away from the root.
    pub const REDUCE_DOWN: CommTag = CommTag::new(8);

    /// Distance from a data tag to its size companion.
    pub const SIZE_CHANNEL: u16 = 16;

    /// Size companion of a data tag.
    pub const fn size_tag(data: CommTag) -> CommTag {
        data.offset(SIZE_CHANNEL)
    }
}

/// Compile-time no-op comm for pure serial paths and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl PollWait for () {
    fn try_wait(&mut self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _recv_len: usize) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- ThreadComm: one in-process universe, one thread per rank ---

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Slot {
    q: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct Mailbox {
    map: Mutex<HashMap<Key, Arc<(Mutex<Slot>, Condvar)>>>,
}

impl Mailbox {
    fn entry(&self, key: Key) -> Arc<(Mutex<Slot>, Condvar)> {
        let mut g = self.map.lock().expect("mailbox poisoned");
        g.entry(key).or_default().clone()
    }
}

struct BarrierState {
    size: usize,
    arrived: usize,
    epoch: usize,
}

/// Shared state of one `ThreadComm` universe.
struct Universe {
    mailbox: Mailbox,
    barrier: (Mutex<BarrierState>, Condvar),
}

/// In-process communicator: `universe(n)` yields one handle per rank, all
/// sharing a private mailbox. Unlike a process-global mailbox, concurrent
/// universes (e.g. parallel tests) cannot see each other's traffic.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    universe: Arc<Universe>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ThreadComm {
    /// Create a universe of `size` ranks.
    pub fn universe(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0);
        let universe = Arc::new(Universe {
            mailbox: Mailbox::default(),
            barrier: (
                Mutex::new(BarrierState {
                    size,
                    arrived: 0,
                    epoch: 0,
                }),
                Condvar::new(),
            ),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                universe: Arc::clone(&universe),
            })
            .collect()
    }

    fn count_pending(&self) -> usize {
        let g = self.universe.mailbox.map.lock().expect("mailbox poisoned");
        g.iter()
            .filter(|((_, dst, _), _)| *dst == self.rank)
            .map(|(_, cell)| cell.0.lock().expect("slot poisoned").q.len())
            .sum()
    }
}

pub struct ThreadSendHandle;

impl Wait for ThreadSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl PollWait for ThreadSendHandle {
    fn try_wait(&mut self) -> Option<Vec<u8>> {
        None
    }
}

pub struct ThreadRecvHandle {
    cell: Arc<(Mutex<Slot>, Condvar)>,
    done: bool,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (lock, cv) = &*self.cell;
        let mut slot = lock.lock().expect("slot poisoned");
        while slot.q.is_empty() {
            slot = cv.wait(slot).expect("condvar poisoned");
        }
        slot.q.pop_front()
    }
}

impl PollWait for ThreadRecvHandle {
    fn try_wait(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        let (lock, _cv) = &*self.cell;
        let mut slot = lock.lock().expect("slot poisoned");
        let msg = slot.q.pop_front();
        if msg.is_some() {
            self.done = true;
        }
        msg
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ThreadSendHandle;
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let entry = self.universe.mailbox.entry((self.rank, peer, tag));
        let (lock, cv) = &*entry;
        {
            let mut slot = lock.lock().expect("slot poisoned");
            slot.q.push_back(buf.to_vec());
        }
        cv.notify_all();
        ThreadSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, _recv_len: usize) -> Self::RecvHandle {
        ThreadRecvHandle {
            cell: self.universe.mailbox.entry((peer, self.rank, tag)),
            done: false,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn pending_message_count(&self) -> Option<usize> {
        Some(self.count_pending())
    }

    fn barrier(&self) {
        let (lock, cv) = &self.universe.barrier;
        let mut b = lock.lock().expect("barrier poisoned");
        let e = b.epoch;
        b.arrived += 1;
        if b.arrived == b.size {
            b.arrived = 0;
            b.epoch += 1;
            cv.notify_all();
        } else {
            while e == b.epoch {
                b = cv.wait(b).expect("barrier condvar poisoned");
            }
        }
    }
}

// --- MPI backend ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use core::ptr::NonNull;
    use mpi::collective::CommunicatorCollectives;
    use mpi::environment::Universe as MpiUniverse;
    use mpi::point_to_point::{Destination, Source};
    use mpi::topology::{Communicator as _, SimpleCommunicator};
    use once_cell::sync::OnceCell;

    static UNIVERSE: OnceCell<MpiUniverse> = OnceCell::new();

    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl Default for MpiComm {
        fn default() -> Self {
            let uni = UNIVERSE.get_or_init(|| mpi::initialize().expect("MPI init failed"));
            let world = uni.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self { world, rank, size }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
            use mpi::request::StaticScope;
            let boxed = buf.to_vec().into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice: &[u8] = unsafe { &*raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, slice, tag as i32);
            MpiSendHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, recv_len: usize) -> Self::RecvHandle {
            use mpi::request::StaticScope;
            let boxed = vec![0u8; recv_len].into_boxed_slice();
            let raw: *mut [u8] = Box::into_raw(boxed);
            let slice_mut: &mut [u8] = unsafe { &mut *raw };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, slice_mut, tag as i32);
            MpiRecvHandle {
                req: Some(req),
                buf: Some(unsafe { NonNull::new_unchecked(raw) }),
                len: recv_len,
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn barrier(&self) {
            self.world.barrier();
        }
    }

    pub struct MpiSendHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
    }

    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            None
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }

    pub struct MpiRecvHandle {
        req: Option<mpi::request::Request<'static, [u8], mpi::request::StaticScope>>,
        buf: Option<NonNull<[u8]>>,
        len: usize,
    }

    unsafe impl Send for MpiRecvHandle {}

    impl MpiRecvHandle {
        fn take_buf(&mut self) -> Vec<u8> {
            let ptr = self.buf.take().expect("buffer missing");
            let boxed: Box<[u8]> = unsafe { Box::from_raw(ptr.as_ptr()) };
            let mut v = Vec::from(boxed);
            v.truncate(self.len);
            v
        }
    }

    impl Wait for MpiRecvHandle {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            Some(self.take_buf())
        }
    }

    impl PollWait for MpiRecvHandle {
        fn try_wait(&mut self) -> Option<Vec<u8>> {
            let req = self.req.take()?;
            match req.test() {
                Ok(_status) => Some(self.take_buf()),
                Err(req) => {
                    self.req = Some(req);
                    None
                }
            }
        }
    }

    impl Drop for MpiRecvHandle {
        fn drop(&mut self) {
            if let Some(r) = self.req.take() {
                let _ = r.wait();
            }
            if let Some(ptr) = self.buf.take() {
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_comm_round_trip() {
        let comms = ThreadComm::universe(2);
        let msg = b"hello".to_vec();
        let _s = comms[0].isend(1, 9, &msg);
        let h = comms[1].irecv(0, 9, msg.len());
        assert_eq!(h.wait().unwrap(), msg);
    }

    #[test]
    fn thread_comm_fifo_per_channel() {
        let comms = ThreadComm::universe(2);
        for i in 0..10u8 {
            let _ = comms[0].isend(1, 9, &[i]);
        }
        let mut out = Vec::new();
        for _ in 0..10 {
            let h = comms[1].irecv(0, 9, 1);
            out.push(h.wait().unwrap()[0]);
        }
        assert_eq!(out, (0u8..10).collect::<Vec<_>>());
    }

    #[test]
    fn try_wait_observes_completion_once() {
        let comms = ThreadComm::universe(2);
        let mut h = comms[1].irecv(0, 9, 1);
        assert!(h.try_wait().is_none());
        let _ = comms[0].isend(1, 9, &[42]);
        assert_eq!(h.try_wait().unwrap(), vec![42]);
        assert!(h.try_wait().is_none());
    }

    #[test]
    fn universes_are_isolated() {
        let a = ThreadComm::universe(2);
        let b = ThreadComm::universe(2);
        let _ = a[0].isend(1, 9, &[1]);
        assert_eq!(b[1].pending_message_count(), Some(0));
        assert_eq!(a[1].pending_message_count(), Some(1));
    }

    #[test]
    fn thread_barrier_epochs() {
        let comms = ThreadComm::universe(4);
        let mut handles = Vec::new();
        for c in comms {
            handles.push(std::thread::spawn(move || {
                for _ in 0..3 {
                    c.barrier();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
