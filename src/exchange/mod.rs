//! Halo exchange engine.
//!
//! An [`ExchangeEngine`] hands out [`HaloChannel`]s over a shared
//! [`Transport`] and [`ProcessTopology`]. Each channel exchanges a fixed
//! selection of variables with one of three wire [`Protocol`]s.

pub mod buffer_layout;
pub mod channel;
pub mod device;
pub mod engine;
pub mod kernels;
pub mod protocol;
pub mod topology;
pub mod transport;
#[cfg(feature = "distributed")]
pub mod transport_mpi;

pub use buffer_layout::{AxisBufferLayout, BlockKind, BufferLayout, SubBlock};
pub use channel::{ChannelState, HaloChannel};
pub use device::Device;
pub use engine::{ChannelConfig, ExchangeEngine, VariableSelection};
pub use kernels::FieldSet;
pub use protocol::Protocol;
pub use topology::{dims_create, Peer, ProcessTopology, Rank};
pub use transport::{LocalTransport, LocalUniverse, Tag, Transport};
#[cfg(feature = "distributed")]
pub use transport_mpi::MpiTransport;
