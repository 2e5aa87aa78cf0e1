//! Wire protocols for moving one axis worth of halo buffers.
//!
//! Every protocol follows the same per-exchange sequence, driven by the
//! channel:
//!
//! 1. `open`: before packing (persistent mode starts its receives here)
//! 2. `transfer`: after packing and the device fence; returns only once
//!    both receive buffers are populated
//! 3. `close`: after unpacking; send buffers are safe to reuse afterwards
//!
//! and `release` once at channel teardown. The three implementations are
//! interchangeable and produce identical buffer contents.

use crate::error::{HaloError, Result};
use crate::layout::{Axis, Side};
use crate::Real;

use super::topology::{Peer, ProcessTopology};
use super::transport::{Tag, Transport};

/// Tags reserved per channel; a channel's tags are
/// `id * TAG_STRIDE + axis * 10 + direction`.
pub const TAG_STRIDE: Tag = 1000;

/// Message tag for `direction` (0 = toward the higher neighbour, 1 = toward
/// the lower one) along `axis` on channel `channel_id`.
pub fn message_tag(channel_id: u32, axis: Axis, direction: usize) -> Option<Tag> {
    let id = Tag::try_from(channel_id).ok()?;
    id.checked_mul(TAG_STRIDE)?
        .checked_add(axis.index() as Tag * 10 + direction as Tag)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Protocol {
    /// Combined send-and-receive per direction, one direction after the other.
    Blocking,
    /// Post everything, wait for receives; sends complete after unpacking.
    NonBlocking,
    /// Transfers registered once at construction and restarted each exchange.
    #[default]
    Persistent,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Blocking => "blocking",
            Protocol::NonBlocking => "non-blocking",
            Protocol::Persistent => "persistent",
        };
        f.write_str(name)
    }
}

/// The four buffers of one axis, indexed by [`Side::index`].
pub(crate) struct AxisBuffers {
    pub send: [Vec<Real>; 2],
    pub recv: [Vec<Real>; 2],
}

impl AxisBuffers {
    pub fn new(len: usize) -> Self {
        Self {
            send: [vec![0.0; len], vec![0.0; len]],
            recv: [vec![0.0; len], vec![0.0; len]],
        }
    }

    pub fn len(&self) -> usize {
        self.send[0].len()
    }
}

/// One direction of transfer along an axis: our `send_side` buffer goes to
/// `dest`, and `source`'s message lands in our `recv_side` buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Route {
    pub send_side: Side,
    pub dest: Peer,
    pub recv_side: Side,
    pub source: Peer,
    pub tag: Tag,
}

/// Both directions of transfer along an axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AxisLink {
    pub axis: Axis,
    pub routes: [Route; 2],
}

impl AxisLink {
    pub fn new(topology: &ProcessTopology, axis: Axis, channel_id: u32) -> Result<Self> {
        let tag = |direction| {
            message_tag(channel_id, axis, direction).ok_or_else(|| {
                HaloError::Config(format!("channel id {channel_id} exhausts the tag space"))
            })
        };
        let (from_left, to_right) = topology.shift(axis, 1);
        let (from_right, to_left) = topology.shift(axis, -1);
        Ok(Self {
            axis,
            routes: [
                Route {
                    send_side: Side::Right,
                    dest: to_right,
                    recv_side: Side::Left,
                    source: from_left,
                    tag: tag(0)?,
                },
                Route {
                    send_side: Side::Left,
                    dest: to_left,
                    recv_side: Side::Right,
                    source: from_right,
                    tag: tag(1)?,
                },
            ],
        })
    }

    /// Which receive buffers get filled by a neighbour, by [`Side::index`].
    pub fn receives(&self) -> [bool; 2] {
        let mut filled = [false; 2];
        for route in &self.routes {
            filled[route.recv_side.index()] = route.source.is_some();
        }
        filled
    }
}

/// Strategy interface shared by the three protocols.
pub(crate) trait WireProtocol<T: Transport>: Send {
    fn protocol(&self) -> Protocol;

    fn open(&mut self, transport: &T) -> Result<()>;

    fn transfer(&mut self, transport: &T, buffers: &mut AxisBuffers) -> Result<()>;

    fn close(&mut self, transport: &T) -> Result<()>;

    fn release(&mut self, transport: &T) -> Result<()>;
}

/// Set up `protocol` for one axis. Persistent mode registers its four
/// transfers with `transport` here, once for the life of the channel.
pub(crate) fn build<T: Transport + 'static>(
    protocol: Protocol,
    link: AxisLink,
    len: usize,
    transport: &T,
) -> Result<Box<dyn WireProtocol<T>>> {
    let wire: Box<dyn WireProtocol<T>> = match protocol {
        Protocol::Blocking => Box::new(Blocking { link }),
        Protocol::NonBlocking => Box::new(NonBlocking::<T> {
            link,
            sends: Vec::with_capacity(2),
        }),
        Protocol::Persistent => Box::new(Persistent::register(transport, link, len)?),
    };
    Ok(wire)
}

struct Blocking {
    link: AxisLink,
}

impl<T: Transport> WireProtocol<T> for Blocking {
    fn protocol(&self) -> Protocol {
        Protocol::Blocking
    }

    fn open(&mut self, _transport: &T) -> Result<()> {
        Ok(())
    }

    fn transfer(&mut self, transport: &T, buffers: &mut AxisBuffers) -> Result<()> {
        for route in &self.link.routes {
            transport.send_recv(
                &buffers.send[route.send_side.index()],
                route.dest,
                &mut buffers.recv[route.recv_side.index()],
                route.source,
                route.tag,
            )?;
        }
        Ok(())
    }

    fn close(&mut self, _transport: &T) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, _transport: &T) -> Result<()> {
        Ok(())
    }
}

struct NonBlocking<T: Transport> {
    link: AxisLink,
    sends: Vec<T::SendRequest>,
}

impl<T: Transport> WireProtocol<T> for NonBlocking<T> {
    fn protocol(&self) -> Protocol {
        Protocol::NonBlocking
    }

    fn open(&mut self, _transport: &T) -> Result<()> {
        if !self.sends.is_empty() {
            return Err(HaloError::Lifecycle(format!(
                "{}: previous sends were never completed",
                self.link.axis
            )));
        }
        Ok(())
    }

    fn transfer(&mut self, transport: &T, buffers: &mut AxisBuffers) -> Result<()> {
        let len = buffers.len();
        let mut recvs = Vec::with_capacity(2);
        for route in &self.link.routes {
            recvs.push((route.recv_side, transport.irecv(len, route.source, route.tag)?));
            self.sends.push(transport.isend(
                &buffers.send[route.send_side.index()],
                route.dest,
                route.tag,
            )?);
        }
        for (side, request) in recvs {
            transport.wait_recv(request, &mut buffers.recv[side.index()])?;
        }
        Ok(())
    }

    fn close(&mut self, transport: &T) -> Result<()> {
        for request in self.sends.drain(..) {
            transport.wait_send(request)?;
        }
        Ok(())
    }

    fn release(&mut self, transport: &T) -> Result<()> {
        self.close(transport)
    }
}

/// A transport registration bound once to a buffer slot.
struct Registered<R> {
    side: Side,
    tag: Tag,
    request: R,
    active: bool,
}

impl<R> Registered<R> {
    fn new(side: Side, tag: Tag, request: R) -> Self {
        Self {
            side,
            tag,
            request,
            active: false,
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.active {
            return Err(HaloError::Lifecycle(format!(
                "persistent request (tag {}) started while still active",
                self.tag
            )));
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.active {
            return Err(HaloError::Lifecycle(format!(
                "persistent request (tag {}) waited on before being started",
                self.tag
            )));
        }
        Ok(())
    }
}

fn count_active<R>(regs: &[Registered<R>]) -> usize {
    regs.iter().filter(|r| r.active).count()
}

struct Persistent<T: Transport> {
    axis: Axis,
    sends: Vec<Registered<T::PersistentSend>>,
    recvs: Vec<Registered<T::PersistentRecv>>,
    released: bool,
}

impl<T: Transport> Persistent<T> {
    fn register(transport: &T, link: AxisLink, len: usize) -> Result<Self> {
        let mut sends = Vec::with_capacity(2);
        let mut recvs = Vec::with_capacity(2);
        for route in link.routes {
            let send = transport.send_init(len, route.dest, route.tag)?;
            sends.push(Registered::new(route.send_side, route.tag, send));
            let recv = transport.recv_init(len, route.source, route.tag)?;
            recvs.push(Registered::new(route.recv_side, route.tag, recv));
        }
        tracing::debug!(axis = %link.axis, len, "persistent requests registered");
        Ok(Self {
            axis: link.axis,
            sends,
            recvs,
            released: false,
        })
    }

    fn check_live(&self) -> Result<()> {
        if self.released {
            return Err(HaloError::Lifecycle(format!(
                "{}: persistent requests already released",
                self.axis
            )));
        }
        Ok(())
    }
}

impl<T: Transport> WireProtocol<T> for Persistent<T> {
    fn protocol(&self) -> Protocol {
        Protocol::Persistent
    }

    fn open(&mut self, transport: &T) -> Result<()> {
        self.check_live()?;
        for reg in &mut self.recvs {
            reg.ensure_idle()?;
            transport.start_recv(&mut reg.request)?;
            reg.active = true;
        }
        Ok(())
    }

    fn transfer(&mut self, transport: &T, buffers: &mut AxisBuffers) -> Result<()> {
        self.check_live()?;
        for reg in &mut self.sends {
            reg.ensure_idle()?;
            transport.start_send(&mut reg.request, &buffers.send[reg.side.index()])?;
            reg.active = true;
        }
        for reg in &mut self.recvs {
            reg.ensure_active()?;
            transport.complete_recv(&mut reg.request, &mut buffers.recv[reg.side.index()])?;
            reg.active = false;
        }
        Ok(())
    }

    fn close(&mut self, transport: &T) -> Result<()> {
        for reg in &mut self.sends {
            reg.ensure_active()?;
            transport.complete_send(&mut reg.request)?;
            reg.active = false;
        }
        Ok(())
    }

    /// Frees every registration. Sends still in flight after a failed
    /// exchange are completed and pending receives are cancelled.
    fn release(&mut self, transport: &T) -> Result<()> {
        self.check_live()?;
        self.released = true;

        let outstanding = count_active(&self.sends) + count_active(&self.recvs);
        if outstanding > 0 {
            tracing::debug!(axis = %self.axis, outstanding, "releasing with requests in flight");
        }
        let mut first_error = None;
        for reg in self.sends.drain(..) {
            if let Err(e) = transport.free_send(reg.request) {
                first_error.get_or_insert(e);
            }
        }
        for reg in self.recvs.drain(..) {
            if let Err(e) = transport.free_recv(reg.request) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
