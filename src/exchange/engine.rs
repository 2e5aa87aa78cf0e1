//! Channel factory and channel configuration.

use std::sync::Arc;

use crate::error::{HaloError, Result};
use crate::layout::{Axis, SubdomainLayout};

use super::channel::HaloChannel;
use super::device::Device;
use super::protocol::Protocol;
use super::topology::ProcessTopology;
use super::transport::Transport;

/// Cell-centered variables to exchange, plus whether the face-centered
/// components ride along.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableSelection {
    indices: Vec<usize>,
    staggered: bool,
}

impl VariableSelection {
    /// `indices` are field components in the order they are packed.
    pub fn new(indices: Vec<usize>, staggered: bool) -> Result<Self> {
        if indices.is_empty() {
            return Err(HaloError::Config(
                "variable selection must name at least one component".into(),
            ));
        }
        let mut seen = indices.clone();
        seen.sort_unstable();
        if let Some(w) = seen.windows(2).find(|w| w[0] == w[1]) {
            return Err(HaloError::Config(format!(
                "variable {} is selected more than once",
                w[0]
            )));
        }
        Ok(Self { indices, staggered })
    }

    /// Components `0..nvar`.
    pub fn all(nvar: usize, staggered: bool) -> Result<Self> {
        Self::new((0..nvar).collect(), staggered)
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn staggered(&self) -> bool {
        self.staggered
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub layout: SubdomainLayout,
    pub variables: VariableSelection,
    pub protocol: Protocol,
}

impl ChannelConfig {
    pub fn new(layout: SubdomainLayout, variables: VariableSelection) -> Self {
        Self {
            layout,
            variables,
            protocol: Protocol::default(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Builds channels that share one transport and process topology.
///
/// Channel ids start at 1 and increase with each channel created; every
/// channel draws its message tags from a range keyed by its id, so channels
/// on the same transport never see each other's messages.
pub struct ExchangeEngine<T: Transport + 'static> {
    transport: Arc<T>,
    topology: Arc<ProcessTopology>,
    device: Device,
    next_id: u32,
}

impl<T: Transport + 'static> ExchangeEngine<T> {
    pub fn new(transport: Arc<T>, topology: ProcessTopology) -> Result<Self> {
        if transport.size() != topology.size() {
            return Err(HaloError::Config(format!(
                "transport has {} ranks but the process grid {:?} needs {}",
                transport.size(),
                topology.dims(),
                topology.size()
            )));
        }
        if transport.rank() != topology.rank() {
            return Err(HaloError::Config(format!(
                "transport rank {} does not match topology rank {}",
                transport.rank(),
                topology.rank()
            )));
        }
        Ok(Self {
            transport,
            topology: Arc::new(topology),
            device: Device::default(),
            next_id: 1,
        })
    }

    /// Run pack/unpack kernels on `device` for channels created from now on.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Allocate buffers, register transfers and hand out the next channel id.
    pub fn create_channel(&mut self, config: &ChannelConfig) -> Result<HaloChannel<T>> {
        for axis in Axis::ALL {
            if !config.layout.is_active(axis) && self.topology.dims()[axis.index()] > 1 {
                return Err(HaloError::Config(format!(
                    "process grid {:?} splits axis {axis}, which a {}-D layout does not have",
                    self.topology.dims(),
                    config.layout.dimensions()
                )));
            }
        }
        let id = self.next_id;
        let channel = HaloChannel::new(
            id,
            Arc::clone(&self.transport),
            &self.topology,
            self.device.clone(),
            config,
        )?;
        self.next_id += 1;
        Ok(channel)
    }
}
