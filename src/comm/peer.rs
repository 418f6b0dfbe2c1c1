//! Framed non-blocking messaging with a tree peer.
//!
//! Each logical message travels as two point-to-point messages: an 8-byte
//! little-endian payload length on the size companion tag, then the
//! payload on the data tag. A [`FramedRecv`] is a small state machine
//! advanced by [`FramedRecv::pump`]; sends are fire-and-forget with their
//! handles parked in a [`SendDrain`] that is emptied before the owning
//! phase returns.

use crate::comm::{tags, CommTag, Communicator, PollWait, Wait};
use crate::error::BalanceError;

/// Post the two sends of one framed message; park the handles in `drain`.
pub fn send_framed<C: Communicator>(
    comm: &C,
    peer: usize,
    data_tag: CommTag,
    payload: &[u8],
    drain: &mut SendDrain<C>,
) {
    let len = (payload.len() as u64).to_le_bytes();
    drain
        .handles
        .push(comm.isend(peer, tags::size_tag(data_tag).as_u16(), &len));
    drain
        .handles
        .push(comm.isend(peer, data_tag.as_u16(), payload));
}

/// Pending send handles. Dropping without [`SendDrain::drain`] still
/// completes each send through the handle's own drop/wait semantics, but
/// the redistributor always drains explicitly before finishing a phase.
pub struct SendDrain<C: Communicator> {
    handles: Vec<C::SendHandle>,
}

impl<C: Communicator> Default for SendDrain<C> {
    fn default() -> Self {
        Self {
            handles: Vec::new(),
        }
    }
}

impl<C: Communicator> SendDrain<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm every posted send has completed.
    pub fn drain(&mut self) {
        for h in self.handles.drain(..) {
            let _ = h.wait();
        }
    }
}

enum RecvState<C: Communicator> {
    AwaitSize(C::RecvHandle),
    AwaitData(C::RecvHandle),
    Done,
}

/// In-flight framed receive from one peer.
pub struct FramedRecv<C: Communicator> {
    peer: usize,
    data_tag: CommTag,
    state: RecvState<C>,
}

impl<C: Communicator> FramedRecv<C> {
    /// Post the size receive.
    pub fn post(comm: &C, peer: usize, data_tag: CommTag) -> Self {
        let h = comm.irecv(peer, tags::size_tag(data_tag).as_u16(), 8);
        Self {
            peer,
            data_tag,
            state: RecvState::AwaitSize(h),
        }
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    /// Advance; returns the payload exactly once, when it completes.
    pub fn pump(&mut self, comm: &C) -> Result<Option<Vec<u8>>, BalanceError> {
        loop {
            match std::mem::replace(&mut self.state, RecvState::Done) {
                RecvState::AwaitSize(mut h) => match h.try_wait() {
                    None => {
                        self.state = RecvState::AwaitSize(h);
                        return Ok(None);
                    }
                    Some(bytes) => {
                        let len = decode_len(&bytes, self.peer)?;
                        let data = comm.irecv(self.peer, self.data_tag.as_u16(), len);
                        self.state = RecvState::AwaitData(data);
                    }
                },
                RecvState::AwaitData(mut h) => match h.try_wait() {
                    None => {
                        self.state = RecvState::AwaitData(h);
                        return Ok(None);
                    }
                    Some(bytes) => return Ok(Some(bytes)),
                },
                RecvState::Done => return Ok(None),
            }
        }
    }

    /// Block until the payload arrives. Used where the rank has no other
    /// work to interleave.
    pub fn wait(self, comm: &C) -> Result<Vec<u8>, BalanceError> {
        match self.state {
            RecvState::AwaitSize(h) => {
                let bytes = h.wait().ok_or_else(|| comm_failure(self.peer))?;
                let len = decode_len(&bytes, self.peer)?;
                let data = comm
                    .irecv(self.peer, self.data_tag.as_u16(), len)
                    .wait()
                    .ok_or_else(|| comm_failure(self.peer))?;
                Ok(data)
            }
            RecvState::AwaitData(h) => h.wait().ok_or_else(|| comm_failure(self.peer)),
            RecvState::Done => Err(comm_failure(self.peer)),
        }
    }
}

fn decode_len(bytes: &[u8], peer: usize) -> Result<usize, BalanceError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BalanceError::MalformedMessage {
            peer,
            detail: format!("size frame of {} bytes, expected 8", bytes.len()),
        })?;
    Ok(u64::from_le_bytes(arr) as usize)
}

fn comm_failure(peer: usize) -> BalanceError {
    BalanceError::CommFailure {
        peer,
        detail: "receive completed without data".into(),
    }
}

/// Pump a set of framed receives until all complete, yielding payloads
/// paired with the peer they came from. Yields to the scheduler between
/// sweeps so thread-backed ranks make progress.
pub fn pump_all<C: Communicator>(
    comm: &C,
    mut pending: Vec<FramedRecv<C>>,
) -> Result<Vec<(usize, Vec<u8>)>, BalanceError> {
    let mut done = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let mut progressed = false;
        let mut i = 0;
        while i < pending.len() {
            if let Some(payload) = pending[i].pump(comm)? {
                let fr = pending.swap_remove(i);
                done.push((fr.peer, payload));
                progressed = true;
            } else {
                i += 1;
            }
        }
        if !progressed {
            std::thread::yield_now();
        }
    }
    Ok(done)
}
