//! Ghost-cell exchange for Cartesian domain-decomposed structured grids.
//!
//! Each rank owns a block of the global grid padded with ghost cells. The
//! [`exchange`] module packs boundary slabs of cell-centered and
//! face-centered fields, moves them to the neighbouring ranks over a
//! [`exchange::Transport`], and unpacks what arrives into the ghost region.

pub mod error;
pub mod exchange;
pub mod field;
pub mod layout;
pub mod pattern;
pub mod stats;

/// Floating-point type carried in fields and exchange buffers.
pub type Real = f64;

pub use error::{HaloError, Result};
pub use field::Field4;
pub use layout::{Axis, Side, SubdomainLayout};
pub use stats::ExchangeStats;
