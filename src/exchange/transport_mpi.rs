//! MPI transport for multi-process halo exchange.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//!
//! # Usage
//!
//! The caller must initialize MPI and build the Cartesian communicator the
//! exchange runs on. The transport takes it over, so neighbour ranks and
//! message addressing share one rank space:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let cart = universe
//!     .world()
//!     .create_cartesian_communicator(&[2, 2], &[true, true], true)
//!     .expect("cartesian communicator failed");
//! let transport = MpiTransport::new(cart)?;
//! let topology = transport.topology()?;
//! ```
//!
//! Every request owns the buffer MPI reads from or writes into, so no
//! caller slice is borrowed past a call. Persistent transfers map onto
//! `MPI_Send_init`/`MPI_Recv_init`, `MPI_Start` and `MPI_Request_free`,
//! which rsmpi does not wrap; those calls go through `mpi::ffi`.

use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};

use mpi::datatype::Equivalence;
use mpi::ffi;
use mpi::raw::AsRaw;
use mpi::topology::CartesianCommunicator;
use mpi::traits::*;

use crate::error::{HaloError, Result};
use crate::Real;

use super::topology::{Peer, ProcessTopology, Rank};
use super::transport::{Tag, Transport};

/// Transport over an MPI Cartesian communicator.
pub struct MpiTransport {
    comm: CartesianCommunicator,
    rank: Rank,
    size: usize,
}

// SAFETY: the communicator handle is an opaque process-wide identifier.
// Driving channels from several threads at once additionally requires MPI
// to be initialized with `Threading::Multiple`.
unsafe impl Send for MpiTransport {}
unsafe impl Sync for MpiTransport {}

impl MpiTransport {
    /// Fails with a configuration error if MPI has not been initialized.
    pub fn new(comm: CartesianCommunicator) -> Result<Self> {
        if !mpi::environment::is_initialized() {
            return Err(HaloError::Config(
                "MPI is not initialized; call mpi::initialize() first".into(),
            ));
        }
        let rank = comm.rank() as Rank;
        let size = comm.size() as usize;
        Ok(Self { comm, rank, size })
    }

    /// Process grid of the communicator this transport sends over.
    pub fn topology(&self) -> Result<ProcessTopology> {
        ProcessTopology::from_mpi(&self.comm)
    }

    fn peer(&self, rank: Rank) -> Result<c_int> {
        if rank >= self.size {
            return Err(HaloError::Transport(format!(
                "rank {}: no such peer {rank}",
                self.rank
            )));
        }
        Ok(rank as c_int)
    }

    /// Create a request over `buffer` with `init`, which receives the buffer
    /// pointer, its length and the handle to fill in.
    fn post(
        &self,
        op: &'static str,
        mut buffer: Box<[Real]>,
        persistent: bool,
        init: impl FnOnce(*mut Real, c_int, *mut ffi::MPI_Request) -> c_int,
    ) -> Result<MpiRequest> {
        let count = c_int::try_from(buffer.len()).map_err(|_| {
            HaloError::Config(format!("{op}: {} values exceed the MPI count range", buffer.len()))
        })?;
        let mut handle = MaybeUninit::<ffi::MPI_Request>::uninit();
        check(op, init(buffer.as_mut_ptr(), count, handle.as_mut_ptr()))?;
        Ok(MpiRequest(Some(RawRequest {
            // SAFETY: a successful call filled in the handle.
            handle: unsafe { handle.assume_init() },
            buffer,
            persistent,
            active: !persistent,
        })))
    }

    fn receive_into(&self, raw: &mut RawRequest, out: &mut [Real]) -> Result<()> {
        if out.len() != raw.buffer.len() {
            return Err(HaloError::Transport(format!(
                "rank {}: receive posted for {} values but buffer holds {}",
                self.rank,
                raw.buffer.len(),
                out.len()
            )));
        }
        let status = raw.wait()?;
        let mut count: c_int = 0;
        // SAFETY: `status` was filled in by a completed receive.
        check("MPI_Get_count", unsafe {
            ffi::MPI_Get_count(&status, datatype(), &mut count)
        })?;
        if count as usize != out.len() {
            return Err(HaloError::Transport(format!(
                "rank {}: message has {count} values, expected {}",
                self.rank,
                out.len()
            )));
        }
        out.copy_from_slice(&raw.buffer);
        Ok(())
    }
}

fn datatype() -> ffi::MPI_Datatype {
    Real::equivalent_datatype().as_raw()
}

fn check(op: &str, code: c_int) -> Result<()> {
    if code != 0 {
        return Err(HaloError::Transport(format!("{op} failed with MPI error code {code}")));
    }
    Ok(())
}

/// An MPI request and the buffer it owns. `None` addresses the null process.
pub struct MpiRequest(Option<RawRequest>);

struct RawRequest {
    handle: ffi::MPI_Request,
    buffer: Box<[Real]>,
    persistent: bool,
    active: bool,
}

// SAFETY: the handle is owned by exactly one `RawRequest` together with the
// buffer it refers to; MPI lets any thread complete a request it holds.
unsafe impl Send for RawRequest {}

impl RawRequest {
    fn start(&mut self) -> Result<()> {
        if self.active {
            return Err(HaloError::Transport("MPI request started while still active".into()));
        }
        // SAFETY: an inactive persistent handle whose buffer lives in `self`.
        check("MPI_Start", unsafe { ffi::MPI_Start(&mut self.handle) })?;
        self.active = true;
        Ok(())
    }

    fn wait(&mut self) -> Result<ffi::MPI_Status> {
        let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
        // SAFETY: the handle is live and `buffer` outlives the operation.
        let code = unsafe { ffi::MPI_Wait(&mut self.handle, status.as_mut_ptr()) };
        self.active = false;
        check("MPI_Wait", code)?;
        // SAFETY: MPI_Wait filled in the status.
        Ok(unsafe { status.assume_init() })
    }

    /// Cancel an operation still in flight, then free a persistent handle.
    fn free(&mut self) -> Result<()> {
        if self.active {
            // SAFETY: the handle is live; the wait below retires it.
            check("MPI_Cancel", unsafe { ffi::MPI_Cancel(&mut self.handle) })?;
            self.wait()?;
        }
        if self.persistent {
            self.persistent = false;
            // SAFETY: an inactive persistent handle, freed exactly once.
            check("MPI_Request_free", unsafe {
                ffi::MPI_Request_free(&mut self.handle)
            })?;
        }
        Ok(())
    }
}

impl Drop for RawRequest {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            tracing::warn!(error = %e, "MPI request teardown");
        }
    }
}

impl Transport for MpiTransport {
    type SendRequest = MpiRequest;
    type RecvRequest = MpiRequest;
    type PersistentSend = MpiRequest;
    type PersistentRecv = MpiRequest;

    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, data: &[Real], dest: Peer, tag: Tag) -> Result<MpiRequest> {
        let Some(dest) = dest else {
            return Ok(MpiRequest(None));
        };
        let (dest, comm) = (self.peer(dest)?, self.comm.as_raw());
        self.post("MPI_Isend", data.into(), false, |buf, count, handle| {
            // SAFETY: `buf` is the request's own heap buffer.
            unsafe { ffi::MPI_Isend(buf.cast::<c_void>(), count, datatype(), dest, tag, comm, handle) }
        })
    }

    fn irecv(&self, len: usize, source: Peer, tag: Tag) -> Result<MpiRequest> {
        let Some(source) = source else {
            return Ok(MpiRequest(None));
        };
        let (source, comm) = (self.peer(source)?, self.comm.as_raw());
        let buffer = vec![0.0; len].into_boxed_slice();
        self.post("MPI_Irecv", buffer, false, |buf, count, handle| {
            // SAFETY: `buf` is the request's own heap buffer.
            unsafe { ffi::MPI_Irecv(buf.cast::<c_void>(), count, datatype(), source, tag, comm, handle) }
        })
    }

    fn wait_recv(&self, request: MpiRequest, out: &mut [Real]) -> Result<()> {
        match request.0 {
            Some(mut raw) => self.receive_into(&mut raw, out),
            None => Ok(()),
        }
    }

    fn wait_send(&self, request: MpiRequest) -> Result<()> {
        if let Some(mut raw) = request.0 {
            raw.wait()?;
        }
        Ok(())
    }

    fn send_init(&self, len: usize, dest: Peer, tag: Tag) -> Result<MpiRequest> {
        let Some(dest) = dest else {
            return Ok(MpiRequest(None));
        };
        let (dest, comm) = (self.peer(dest)?, self.comm.as_raw());
        let buffer = vec![0.0; len].into_boxed_slice();
        self.post("MPI_Send_init", buffer, true, |buf, count, handle| {
            // SAFETY: `buf` is the request's own heap buffer, which lives as
            // long as the registration.
            unsafe { ffi::MPI_Send_init(buf.cast::<c_void>(), count, datatype(), dest, tag, comm, handle) }
        })
    }

    fn recv_init(&self, len: usize, source: Peer, tag: Tag) -> Result<MpiRequest> {
        let Some(source) = source else {
            return Ok(MpiRequest(None));
        };
        let (source, comm) = (self.peer(source)?, self.comm.as_raw());
        let buffer = vec![0.0; len].into_boxed_slice();
        self.post("MPI_Recv_init", buffer, true, |buf, count, handle| {
            // SAFETY: as in `send_init`.
            unsafe { ffi::MPI_Recv_init(buf.cast::<c_void>(), count, datatype(), source, tag, comm, handle) }
        })
    }

    fn start_send(&self, request: &mut MpiRequest, data: &[Real]) -> Result<()> {
        let Some(raw) = request.0.as_mut() else {
            return Ok(());
        };
        if raw.active || data.len() != raw.buffer.len() {
            return Err(HaloError::Transport(format!(
                "rank {}: cannot start a {}-value registered send with {} values",
                self.rank,
                raw.buffer.len(),
                data.len()
            )));
        }
        raw.buffer.copy_from_slice(data);
        raw.start()
    }

    fn start_recv(&self, request: &mut MpiRequest) -> Result<()> {
        match request.0.as_mut() {
            Some(raw) => raw.start(),
            None => Ok(()),
        }
    }

    fn complete_send(&self, request: &mut MpiRequest) -> Result<()> {
        if let Some(raw) = request.0.as_mut() {
            raw.wait()?;
        }
        Ok(())
    }

    fn complete_recv(&self, request: &mut MpiRequest, out: &mut [Real]) -> Result<()> {
        match request.0.as_mut() {
            Some(raw) => self.receive_into(raw, out),
            None => Ok(()),
        }
    }

    fn free_send(&self, request: MpiRequest) -> Result<()> {
        let Some(mut raw) = request.0 else {
            return Ok(());
        };
        if raw.active {
            raw.wait()?;
        }
        raw.free()
    }

    fn free_recv(&self, request: MpiRequest) -> Result<()> {
        match request.0 {
            Some(mut raw) => raw.free(),
            None => Ok(()),
        }
    }

    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }
}
