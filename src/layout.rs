//! Grid axes and per-rank subdomain extents.
//!
//! A subdomain is the interior block owned by one rank, padded on each
//! active axis by `ghost` cells on both sides. Local indices along an axis
//! run `0..total`, with the interior at `begin..end`.

use crate::error::{HaloError, Result};
use crate::exchange::ProcessTopology;

/// A grid axis. `X1` is the fastest-varying index in memory (`i`), `X3` the
/// slowest (`k`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    X1,
    X2,
    X3,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X1, Axis::X2, Axis::X3];

    pub fn index(self) -> usize {
        match self {
            Axis::X1 => 0,
            Axis::X2 => 1,
            Axis::X3 => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Axis> {
        Axis::ALL.get(index).copied()
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X{}", self.index() + 1)
    }
}

/// One of the two faces of a subdomain along an axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Extents of a subdomain along a single axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisExtent {
    pub ghost: usize,
    pub interior: usize,
    pub total: usize,
    pub begin: usize,
    pub end: usize,
}

impl AxisExtent {
    fn new(ghost: usize, interior: usize) -> Self {
        Self {
            ghost,
            interior,
            total: interior + 2 * ghost,
            begin: ghost,
            end: ghost + interior,
        }
    }

    /// Extent of an axis that is not part of the active dimensionality.
    fn inactive() -> Self {
        Self::new(0, 1)
    }
}

/// Local array extents of one rank's subdomain, for 1 to 3 active axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubdomainLayout {
    dimensions: usize,
    axes: [AxisExtent; 3],
}

impl SubdomainLayout {
    /// Build a layout from per-axis ghost widths and interior counts.
    ///
    /// Axes at or beyond `dimensions` are inactive and must be given as
    /// ghost width 0 with one interior cell. Active axes need at least one
    /// ghost cell and no fewer interior cells than ghost cells, so that the
    /// two boundary slabs packed for the neighbours never overlap a ghost
    /// region.
    pub fn new(dimensions: usize, ghost: [usize; 3], interior: [usize; 3]) -> Result<Self> {
        if !(1..=3).contains(&dimensions) {
            return Err(HaloError::Config(format!(
                "dimensions must be 1, 2 or 3, got {dimensions}"
            )));
        }
        let mut axes = [AxisExtent::inactive(); 3];
        for axis in Axis::ALL {
            let d = axis.index();
            if d < dimensions {
                if ghost[d] == 0 {
                    return Err(HaloError::Config(format!(
                        "axis {axis} is active but has no ghost cells"
                    )));
                }
                if interior[d] < ghost[d] {
                    return Err(HaloError::Config(format!(
                        "axis {axis}: interior count {} is smaller than ghost width {}",
                        interior[d], ghost[d]
                    )));
                }
                axes[d] = AxisExtent::new(ghost[d], interior[d]);
            } else if ghost[d] != 0 || interior[d] != 1 {
                return Err(HaloError::Config(format!(
                    "axis {axis} is inactive in a {dimensions}-D layout and must have \
                     ghost width 0 and interior count 1 (got {} and {})",
                    ghost[d], interior[d]
                )));
            }
        }
        Ok(Self { dimensions, axes })
    }

    /// Same ghost width on every active axis.
    pub fn uniform(dimensions: usize, ghost: usize, interior: [usize; 3]) -> Result<Self> {
        let mut g = [0; 3];
        for (d, slot) in g.iter_mut().enumerate() {
            if d < dimensions {
                *slot = ghost;
            }
        }
        Self::new(dimensions, g, interior)
    }

    /// Split a `global` interior across `topology`'s process grid and return
    /// this rank's layout with the global index of its first interior cell.
    pub fn decompose(
        dimensions: usize,
        ghost: usize,
        global: [usize; 3],
        topology: &ProcessTopology,
    ) -> Result<(Self, [usize; 3])> {
        let mut interior = [1; 3];
        let mut start = [0; 3];
        for axis in Axis::ALL {
            let d = axis.index();
            if d < dimensions {
                (interior[d], start[d]) = topology.local_extent(axis, global[d])?;
            } else if topology.dims()[d] > 1 {
                return Err(HaloError::Config(format!(
                    "axis {axis} is split across {} ranks but inactive in a {dimensions}-D grid",
                    topology.dims()[d]
                )));
            }
        }
        Ok((Self::uniform(dimensions, ghost, interior)?, start))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn is_active(&self, axis: Axis) -> bool {
        axis.index() < self.dimensions
    }

    pub fn active_axes(&self) -> impl Iterator<Item = Axis> + '_ {
        Axis::ALL.into_iter().filter(move |&a| self.is_active(a))
    }

    pub fn axis(&self, axis: Axis) -> &AxisExtent {
        &self.axes[axis.index()]
    }

    pub fn ghost(&self, axis: Axis) -> usize {
        self.axes[axis.index()].ghost
    }

    pub fn interior(&self, axis: Axis) -> usize {
        self.axes[axis.index()].interior
    }

    pub fn total(&self, axis: Axis) -> usize {
        self.axes[axis.index()].total
    }

    pub fn begin(&self, axis: Axis) -> usize {
        self.axes[axis.index()].begin
    }

    pub fn end(&self, axis: Axis) -> usize {
        self.axes[axis.index()].end
    }

    /// 1 if staggered arrays carry an extra face along `axis`, else 0.
    pub fn face_offset(&self, axis: Axis) -> usize {
        usize::from(self.is_active(axis))
    }

    /// Shape `(nvar, k, j, i)` of a cell-centered array with `nvar` components.
    pub fn cell_shape(&self, nvar: usize) -> [usize; 4] {
        [
            nvar,
            self.total(Axis::X3),
            self.total(Axis::X2),
            self.total(Axis::X1),
        ]
    }

    /// Shape `(component, k, j, i)` of the face-centered array: one component
    /// per active axis, each with one extra face along every active axis.
    pub fn staggered_shape(&self) -> [usize; 4] {
        [
            self.dimensions,
            self.total(Axis::X3) + self.face_offset(Axis::X3),
            self.total(Axis::X2) + self.face_offset(Axis::X2),
            self.total(Axis::X1) + self.face_offset(Axis::X1),
        ]
    }
}
