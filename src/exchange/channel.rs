//! One configured halo-exchange channel.
//!
//! A channel owns the four buffers of every active axis and the wire
//! protocol that moves them. Each axis exchange runs strictly in order:
//! open, pack, fence, transfer, unpack, close.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{HaloError, Result};
use crate::field::Field4;
use crate::layout::{Axis, SubdomainLayout};
use crate::stats::ExchangeStats;
use crate::Real;

use super::buffer_layout::AxisBufferLayout;
use super::device::Device;
use super::engine::ChannelConfig;
use super::kernels::{self, FieldSet, VariableMap};
use super::protocol::{self, AxisBuffers, AxisLink, Protocol, WireProtocol};
use super::topology::ProcessTopology;
use super::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Buffers allocated and registrations created; exchanges allowed.
    Ready,
    /// An exchange failed; the ghost state is undefined and no further
    /// exchange is accepted.
    Faulted,
    /// Registrations released.
    Released,
}

struct AxisChannel<T: Transport> {
    layout: AxisBufferLayout,
    link: AxisLink,
    buffers: AxisBuffers,
    wire: Box<dyn WireProtocol<T>>,
}

pub struct HaloChannel<T: Transport + 'static> {
    id: u32,
    transport: Arc<T>,
    device: Device,
    layout: SubdomainLayout,
    nvar: usize,
    staggered: bool,
    vars: VariableMap,
    protocol: Protocol,
    /// Indexed by [`Axis::index`]; `None` for inactive axes.
    axes: [Option<AxisChannel<T>>; 3],
    state: ChannelState,
    stats: ExchangeStats,
}

impl<T: Transport + 'static> HaloChannel<T> {
    pub(crate) fn new(
        id: u32,
        transport: Arc<T>,
        topology: &ProcessTopology,
        device: Device,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let _span = tracing::info_span!("channel_init", channel = id).entered();
        let layout = config.layout;
        let indices = config.variables.indices();
        let staggered = config.variables.staggered();
        let nvar = match indices.iter().max() {
            Some(&m) => m.checked_add(1).ok_or_else(|| {
                HaloError::Config(format!("variable index {m} is out of range"))
            })?,
            None => 0,
        };

        let mut axes: [Option<AxisChannel<T>>; 3] = [None, None, None];
        let mut stats = ExchangeStats::default();
        for axis in layout.active_axes() {
            let buffer_layout = AxisBufferLayout::new(&layout, axis, indices.len(), staggered);
            let len = buffer_layout.len();
            let link = AxisLink::new(topology, axis, id)?;
            stats.message_len[axis.index()] = len;
            axes[axis.index()] = Some(AxisChannel {
                layout: buffer_layout,
                link,
                buffers: AxisBuffers::new(len),
                wire: protocol::build(config.protocol, link, len, &*transport)?,
            });
        }

        tracing::info!(
            protocol = %config.protocol,
            variables = indices.len(),
            staggered,
            x1 = stats.message_len[0],
            x2 = stats.message_len[1],
            x3 = stats.message_len[2],
            "channel ready"
        );

        Ok(Self {
            id,
            transport,
            device,
            layout,
            nvar,
            staggered,
            vars: VariableMap::new(indices),
            protocol: config.protocol,
            axes,
            state: ChannelState::Ready,
            stats,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn layout(&self) -> &SubdomainLayout {
        &self.layout
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    /// Element count of each of the four buffers along `axis`.
    pub fn buffer_len(&self, axis: Axis) -> usize {
        self.axes[axis.index()]
            .as_ref()
            .map_or(0, |a| a.layout.len())
    }

    /// Fill the ghost cells along `axis` from the neighbouring ranks.
    ///
    /// Axes beyond the layout's dimensionality are skipped. Ghost slabs
    /// facing a missing neighbour are left untouched.
    pub fn exchange_axis(&mut self, axis: Axis, fields: &mut FieldSet<'_>) -> Result<()> {
        self.ensure_ready()?;
        if !self.layout.is_active(axis) {
            return Ok(());
        }
        self.check_fields(fields)?;

        let result = self.run_axis(axis, fields);
        if let Err(e) = &result {
            tracing::error!(channel = self.id, %axis, error = %e, "exchange failed");
            self.state = ChannelState::Faulted;
        }
        result
    }

    /// Exchange every active axis in order X1, X2, X3, so edge and corner
    /// ghosts are filled too.
    pub fn exchange_all(&mut self, fields: &mut FieldSet<'_>) -> Result<()> {
        for axis in Axis::ALL {
            self.exchange_axis(axis, fields)?;
        }
        Ok(())
    }

    /// Convenience wrapper for a channel without face-centered data.
    pub fn exchange_cells(&mut self, axis: Axis, cell: &mut Field4) -> Result<()> {
        let mut fields = FieldSet {
            cell,
            staggered: None,
        };
        self.exchange_axis(axis, &mut fields)
    }

    /// Release persistent registrations and report. Consumes the channel.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn run_axis(&mut self, axis: Axis, fields: &mut FieldSet<'_>) -> Result<()> {
        let _span = tracing::debug_span!("exchange_axis", channel = self.id, %axis).entered();
        let start = Instant::now();
        let transport = &*self.transport;
        let ax = self.axes[axis.index()].as_mut().ok_or_else(|| {
            HaloError::Lifecycle(format!("{axis}: no buffers allocated"))
        })?;

        ax.wire.open(transport)?;
        kernels::pack(&self.device, &ax.layout, &self.vars, fields, &mut ax.buffers.send)?;
        self.device.fence();

        let sent = Instant::now();
        ax.wire.transfer(transport, &mut ax.buffers)?;
        let mut transport_time = sent.elapsed();
        tracing::trace!(len = ax.buffers.len(), "receives complete");

        kernels::unpack(
            &self.device,
            &ax.layout,
            &self.vars,
            fields,
            &ax.buffers.recv,
            ax.link.receives(),
        )?;

        let closing = Instant::now();
        ax.wire.close(transport)?;
        transport_time += closing.elapsed();

        let bytes = 4 * ax.buffers.len() * std::mem::size_of::<Real>();
        self.stats
            .record(axis, bytes as u64, start.elapsed(), transport_time);
        self.stats.fences += 1;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            ChannelState::Ready => Ok(()),
            ChannelState::Faulted => Err(HaloError::Lifecycle(format!(
                "channel {} faulted during an earlier exchange",
                self.id
            ))),
            ChannelState::Released => Err(HaloError::Lifecycle(format!(
                "channel {} has been released",
                self.id
            ))),
        }
    }

    fn check_fields(&self, fields: &FieldSet<'_>) -> Result<()> {
        let shape = fields.cell.shape();
        let expected = self.layout.cell_shape(shape[0]);
        if shape != expected || shape[0] < self.nvar {
            return Err(HaloError::Config(format!(
                "cell field has shape {shape:?}, channel {} needs [>= {}, {}, {}, {}]",
                self.id, self.nvar, expected[1], expected[2], expected[3]
            )));
        }
        if self.staggered {
            let expected = self.layout.staggered_shape();
            match fields.staggered.as_deref() {
                None => {
                    return Err(HaloError::Config(format!(
                        "channel {} exchanges face-centered data but no staggered field was given",
                        self.id
                    )))
                }
                Some(f) if f.shape() != expected => {
                    return Err(HaloError::Config(format!(
                        "staggered field has shape {:?}, channel {} needs {expected:?}",
                        f.shape(),
                        self.id
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.state == ChannelState::Released {
            return Ok(());
        }
        self.state = ChannelState::Released;

        let mut first_error = None;
        for ax in self.axes.iter_mut().flatten() {
            if let Err(e) = ax.wire.release(&*self.transport) {
                first_error.get_or_insert(e);
            }
        }
        self.report();
        first_error.map_or(Ok(()), Err)
    }

    /// Throughput line logged when the channel is released. Only the first
    /// channel of an engine reports one.
    pub fn throughput_report(&self) -> Option<String> {
        (self.id == 1).then(|| {
            format!(
                "halo exchange throughput {:.2} MiB/s (X1 {:.4} MiB, X2 {:.4} MiB, X3 {:.4} MiB)",
                self.stats.throughput_mib_per_sec(),
                self.stats.message_mib(Axis::X1),
                self.stats.message_mib(Axis::X2),
                self.stats.message_mib(Axis::X3),
            )
        })
    }

    fn report(&self) {
        tracing::info!(
            channel = self.id,
            bytes = self.stats.bytes,
            exchanges = self.stats.total_exchanges(),
            comm_secs = self.stats.comm_time.as_secs_f64(),
            "channel released"
        );
        if let Some(line) = self.throughput_report() {
            tracing::info!("{line}");
        }
    }
}

impl<T: Transport + 'static> Drop for HaloChannel<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(channel = self.id, error = %e, "channel teardown");
        }
    }
}

impl<T: Transport + 'static> std::fmt::Debug for HaloChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaloChannel")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("layout", &self.layout)
            .finish()
    }
}
