//! Point-to-point message transport between ranks.
//!
//! Provides the `Transport` trait the exchange channels talk to, and an
//! in-process implementation where each rank is a thread.
//!
//! Peers are [`Peer`]s: `None` is the null process. Every primitive
//! addressed to the null process completes immediately without touching
//! the buffer, so callers never branch on domain edges themselves.

use std::collections::VecDeque;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{HaloError, Result};
use crate::Real;

use super::topology::{Peer, Rank};

/// Message tag. Messages match on (source, tag) and are delivered in order
/// for a given pair.
pub type Tag = i32;

/// Abstraction over inter-process communication for halo exchange.
///
/// Implementations: `LocalTransport` (threads in one process), `MpiTransport`
/// (via the mpi crate, feature `distributed`).
pub trait Transport: Send + Sync {
    /// Handle for an outstanding send.
    type SendRequest: Send;
    /// Handle for an outstanding receive.
    type RecvRequest: Send;
    /// A send registered once and restarted for every exchange.
    type PersistentSend: Send;
    /// A receive registered once and restarted for every exchange.
    type PersistentRecv: Send;

    /// This process's rank.
    fn rank(&self) -> Rank;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Start sending `data` to `dest`. The data is captured before the call
    /// returns, so `data` may be reused immediately.
    fn isend(&self, data: &[Real], dest: Peer, tag: Tag) -> Result<Self::SendRequest>;

    /// Post a receive of `len` values from `source`.
    fn irecv(&self, len: usize, source: Peer, tag: Tag) -> Result<Self::RecvRequest>;

    /// Block until the receive completes and copy the message into `out`.
    /// A receive from the null process leaves `out` untouched.
    fn wait_recv(&self, request: Self::RecvRequest, out: &mut [Real]) -> Result<()>;

    /// Block until the send has been accepted by the transport.
    fn wait_send(&self, request: Self::SendRequest) -> Result<()>;

    /// Combined send and receive; returns once `recv` is populated.
    fn send_recv(
        &self,
        send: &[Real],
        dest: Peer,
        recv: &mut [Real],
        source: Peer,
        tag: Tag,
    ) -> Result<()> {
        let r = self.irecv(recv.len(), source, tag)?;
        let s = self.isend(send, dest, tag)?;
        self.wait_recv(r, recv)?;
        self.wait_send(s)
    }

    /// Register a send of `len` values to `dest`. Nothing moves until
    /// [`Transport::start_send`].
    fn send_init(&self, len: usize, dest: Peer, tag: Tag) -> Result<Self::PersistentSend>;

    /// Register a receive of `len` values from `source`.
    fn recv_init(&self, len: usize, source: Peer, tag: Tag) -> Result<Self::PersistentRecv>;

    /// Start a registered send carrying `data`.
    fn start_send(&self, request: &mut Self::PersistentSend, data: &[Real]) -> Result<()>;

    /// Start a registered receive.
    fn start_recv(&self, request: &mut Self::PersistentRecv) -> Result<()>;

    /// Block until a started send completes. The registration stays valid.
    fn complete_send(&self, request: &mut Self::PersistentSend) -> Result<()>;

    /// Block until a started receive completes and copy it into `out`.
    fn complete_recv(&self, request: &mut Self::PersistentRecv, out: &mut [Real]) -> Result<()>;

    /// Drop a registration. An active send is completed first.
    fn free_send(&self, request: Self::PersistentSend) -> Result<()>;

    /// Drop a registration. An active receive is cancelled.
    fn free_recv(&self, request: Self::PersistentRecv) -> Result<()>;

    /// Synchronization barrier.
    fn barrier(&self) -> Result<()>;
}

struct Envelope {
    source: Rank,
    tag: Tag,
    data: Vec<Real>,
}

/// Factory for a set of in-process ranks.
pub struct LocalUniverse;

impl LocalUniverse {
    /// Create `size` connected transports, one per rank. Receives block
    /// until a matching message arrives.
    pub fn create(size: usize) -> Vec<LocalTransport> {
        Self::build(size, None)
    }

    /// Like [`LocalUniverse::create`], but a receive that sees no matching
    /// message within `timeout` fails with a transport error.
    pub fn with_timeout(size: usize, timeout: Duration) -> Vec<LocalTransport> {
        Self::build(size, Some(timeout))
    }

    fn build(size: usize, timeout: Option<Duration>) -> Vec<LocalTransport> {
        let (senders, receivers): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..size).map(|_| unbounded()).unzip();
        let barrier = Arc::new(Barrier::new(size.max(1)));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                outboxes: senders.clone(),
                inbox,
                pending: Mutex::new(VecDeque::new()),
                timeout,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

/// One rank of a [`LocalUniverse`].
///
/// Sends are eager: the payload is copied into the destination's inbox at
/// `isend` time. Messages that arrive ahead of the receive that wants them
/// are parked until matched.
pub struct LocalTransport {
    rank: Rank,
    outboxes: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    pending: Mutex<VecDeque<Envelope>>,
    timeout: Option<Duration>,
    barrier: Arc<Barrier>,
}

pub struct LocalSend;

#[derive(Clone, Copy)]
pub struct LocalRecv {
    source: Peer,
    tag: Tag,
    len: usize,
}

/// Registered send: the destination's inbox is resolved once.
pub struct LocalPersistentSend {
    outbox: Option<Sender<Envelope>>,
    tag: Tag,
    len: usize,
}

/// Registered receive. Matching happens at completion; messages that
/// arrive before then are parked.
pub struct LocalPersistentRecv(LocalRecv);

impl LocalTransport {
    fn take_parked(&self, source: Rank, tag: Tag) -> Option<Envelope> {
        let mut pending = self.pending.lock();
        let pos = pending
            .iter()
            .position(|e| e.source == source && e.tag == tag)?;
        pending.remove(pos)
    }

    fn next_envelope(&self) -> Result<Envelope> {
        match self.timeout {
            None => self
                .inbox
                .recv()
                .map_err(|_| HaloError::Transport(format!("rank {}: inbox closed", self.rank))),
            Some(timeout) => self.inbox.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => HaloError::Transport(format!(
                    "rank {}: no message within {timeout:?}",
                    self.rank
                )),
                RecvTimeoutError::Disconnected => {
                    HaloError::Transport(format!("rank {}: inbox closed", self.rank))
                }
            }),
        }
    }

    fn outbox(&self, dest: Rank) -> Result<&Sender<Envelope>> {
        self.outboxes.get(dest).ok_or_else(|| {
            HaloError::Transport(format!("rank {}: no such destination {dest}", self.rank))
        })
    }

    fn deliver(&self, outbox: &Sender<Envelope>, data: &[Real], tag: Tag) -> Result<()> {
        outbox
            .send(Envelope {
                source: self.rank,
                tag,
                data: data.to_vec(),
            })
            .map_err(|_| HaloError::Transport(format!("rank {}: peer has shut down", self.rank)))
    }

    fn check_source(&self, source: Peer) -> Result<()> {
        match source {
            Some(source) if source >= self.size() => Err(HaloError::Transport(format!(
                "rank {}: no such source {source}",
                self.rank
            ))),
            _ => Ok(()),
        }
    }

    fn matching(&self, source: Rank, tag: Tag) -> Result<Envelope> {
        if let Some(envelope) = self.take_parked(source, tag) {
            return Ok(envelope);
        }
        loop {
            let envelope = self.next_envelope()?;
            if envelope.source == source && envelope.tag == tag {
                return Ok(envelope);
            }
            self.pending.lock().push_back(envelope);
        }
    }
}

impl Transport for LocalTransport {
    type SendRequest = LocalSend;
    type RecvRequest = LocalRecv;
    type PersistentSend = LocalPersistentSend;
    type PersistentRecv = LocalPersistentRecv;

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn isend(&self, data: &[Real], dest: Peer, tag: Tag) -> Result<LocalSend> {
        if let Some(dest) = dest {
            self.deliver(self.outbox(dest)?, data, tag)?;
        }
        Ok(LocalSend)
    }

    fn irecv(&self, len: usize, source: Peer, tag: Tag) -> Result<LocalRecv> {
        self.check_source(source)?;
        Ok(LocalRecv { source, tag, len })
    }

    fn wait_recv(&self, request: LocalRecv, out: &mut [Real]) -> Result<()> {
        let Some(source) = request.source else {
            return Ok(());
        };
        if out.len() != request.len {
            return Err(HaloError::Transport(format!(
                "rank {}: receive posted for {} values but buffer holds {}",
                self.rank,
                request.len,
                out.len()
            )));
        }
        let envelope = self.matching(source, request.tag)?;
        if envelope.data.len() != out.len() {
            return Err(HaloError::Transport(format!(
                "rank {}: message from {source} (tag {}) has {} values, expected {}",
                self.rank,
                request.tag,
                envelope.data.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&envelope.data);
        Ok(())
    }

    fn wait_send(&self, _request: LocalSend) -> Result<()> {
        // Eager: the payload already sits in the destination inbox.
        Ok(())
    }

    fn send_init(&self, len: usize, dest: Peer, tag: Tag) -> Result<LocalPersistentSend> {
        let outbox = dest.map(|d| self.outbox(d).cloned()).transpose()?;
        Ok(LocalPersistentSend { outbox, tag, len })
    }

    fn recv_init(&self, len: usize, source: Peer, tag: Tag) -> Result<LocalPersistentRecv> {
        self.irecv(len, source, tag).map(LocalPersistentRecv)
    }

    fn start_send(&self, request: &mut LocalPersistentSend, data: &[Real]) -> Result<()> {
        if data.len() != request.len {
            return Err(HaloError::Transport(format!(
                "rank {}: send registered for {} values but given {}",
                self.rank,
                request.len,
                data.len()
            )));
        }
        match &request.outbox {
            Some(outbox) => self.deliver(outbox, data, request.tag),
            None => Ok(()),
        }
    }

    fn start_recv(&self, _request: &mut LocalPersistentRecv) -> Result<()> {
        Ok(())
    }

    fn complete_send(&self, _request: &mut LocalPersistentSend) -> Result<()> {
        Ok(())
    }

    fn complete_recv(&self, request: &mut LocalPersistentRecv, out: &mut [Real]) -> Result<()> {
        self.wait_recv(request.0, out)
    }

    fn free_send(&self, _request: LocalPersistentSend) -> Result<()> {
        Ok(())
    }

    fn free_recv(&self, _request: LocalPersistentRecv) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_rank_and_size() {
        let ranks = LocalUniverse::create(3);
        assert_eq!(ranks.len(), 3);
        assert_eq!(ranks[2].rank(), 2);
        assert_eq!(ranks[0].size(), 3);
    }

    #[test]
    fn self_send_recv() {
        let ranks = LocalUniverse::create(1);
        let mut recv = vec![0.0; 3];
        ranks[0]
            .send_recv(&[1.0, 2.0, 3.0], Some(0), &mut recv, Some(0), 7)
            .unwrap();
        assert_eq!(recv, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn two_ranks_swap_across_threads() {
        let ranks = LocalUniverse::create(2);
        std::thread::scope(|s| {
            for t in &ranks {
                s.spawn(move || {
                    let me = t.rank();
                    let other = 1 - me;
                    let mut recv = vec![0.0; 2];
                    t.send_recv(&[me as Real; 2], Some(other), &mut recv, Some(other), 1)
                        .unwrap();
                    assert_eq!(recv, vec![other as Real; 2]);
                });
            }
        });
    }

    #[test]
    fn receives_match_on_tag_not_arrival_order() {
        let ranks = LocalUniverse::create(1);
        let t = &ranks[0];
        let late = t.irecv(1, Some(0), 2).unwrap();
        let early = t.irecv(1, Some(0), 1).unwrap();
        t.isend(&[1.0], Some(0), 1).unwrap();
        t.isend(&[2.0], Some(0), 2).unwrap();
        let mut a = [0.0];
        let mut b = [0.0];
        t.wait_recv(late, &mut a).unwrap();
        t.wait_recv(early, &mut b).unwrap();
        assert_eq!((a[0], b[0]), (2.0, 1.0));
    }

    #[test]
    fn null_process_is_a_no_op() {
        let ranks = LocalUniverse::create(1);
        let mut recv = vec![-5.0; 2];
        ranks[0]
            .send_recv(&[1.0, 2.0], None, &mut recv, None, 0)
            .unwrap();
        assert_eq!(recv, vec![-5.0, -5.0]);
    }

    #[test]
    fn missing_message_times_out() {
        let ranks = LocalUniverse::with_timeout(1, Duration::from_millis(20));
        let r = ranks[0].irecv(1, Some(0), 3).unwrap();
        let mut out = [0.0];
        let err = ranks[0].wait_recv(r, &mut out).unwrap_err();
        assert!(matches!(err, HaloError::Transport(_)));
    }

    #[test]
    fn registered_transfers_restart_across_rounds() {
        let ranks = LocalUniverse::create(1);
        let t = &ranks[0];
        let mut send = t.send_init(2, Some(0), 5).unwrap();
        let mut recv = t.recv_init(2, Some(0), 5).unwrap();
        for round in 0..3 {
            let value = round as Real;
            t.start_recv(&mut recv).unwrap();
            t.start_send(&mut send, &[value, value + 0.5]).unwrap();
            let mut out = [0.0; 2];
            t.complete_recv(&mut recv, &mut out).unwrap();
            t.complete_send(&mut send).unwrap();
            assert_eq!(out, [value, value + 0.5]);
        }
        t.free_send(send).unwrap();
        t.free_recv(recv).unwrap();
    }

    #[test]
    fn registered_send_checks_length() {
        let ranks = LocalUniverse::create(1);
        let mut send = ranks[0].send_init(2, None, 1).unwrap();
        assert!(matches!(
            ranks[0].start_send(&mut send, &[1.0]),
            Err(HaloError::Transport(_))
        ));
    }

    #[test]
    fn length_mismatch_is_a_transport_error() {
        let ranks = LocalUniverse::create(1);
        let mut recv = vec![0.0; 2];
        let err = ranks[0]
            .send_recv(&[1.0, 2.0, 3.0], Some(0), &mut recv, Some(0), 0)
            .unwrap_err();
        assert!(matches!(err, HaloError::Transport(_)));
    }
}
