//! Cartesian process topology.
//!
//! Ranks are laid out on a 3-D process grid in row-major order (the last
//! axis varies fastest, matching MPI's Cartesian numbering). Shifting along
//! an axis yields the source and destination ranks of a transfer; at a
//! non-periodic domain edge the missing neighbour is `None`, the null
//! process, which every transport treats as a no-op.

use crate::error::{HaloError, Result};
use crate::layout::{Axis, Side};

/// Index of a rank within the transport's communicator.
pub type Rank = usize;

/// A transfer partner; `None` is the null process.
pub type Peer = Option<Rank>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessTopology {
    rank: Rank,
    dims: [usize; 3],
    periodic: [bool; 3],
    coords: [usize; 3],
    /// `neighbors[axis][side]`
    neighbors: [[Peer; 2]; 3],
}

impl ProcessTopology {
    /// Topology of `rank` on a `dims` process grid.
    pub fn cartesian(rank: Rank, dims: [usize; 3], periodic: [bool; 3]) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(HaloError::Config(format!(
                "process grid {dims:?} has an empty axis"
            )));
        }
        let size: usize = dims.iter().product();
        if rank >= size {
            return Err(HaloError::Config(format!(
                "rank {rank} is outside a process grid of {size} ranks"
            )));
        }

        let coords = coords_in(dims, rank);
        let mut neighbors = [[None; 2]; 3];
        for axis in Axis::ALL {
            for side in Side::BOTH {
                neighbors[axis.index()][side.index()] =
                    neighbor_in(dims, periodic, coords, axis, side);
            }
        }

        Ok(Self {
            rank,
            dims,
            periodic,
            coords,
            neighbors,
        })
    }

    /// A lone rank, periodic along every axis (each rank is its own neighbour).
    pub fn single_periodic() -> Self {
        Self {
            rank: 0,
            dims: [1; 3],
            periodic: [true; 3],
            coords: [0; 3],
            neighbors: [[Some(0); 2]; 3],
        }
    }

    /// Build the topology from an MPI Cartesian communicator.
    #[cfg(feature = "distributed")]
    pub fn from_mpi(comm: &mpi::topology::CartesianCommunicator) -> Result<Self> {
        use mpi::traits::Communicator;

        let layout = comm.get_layout();
        if layout.dims.len() > 3 {
            return Err(HaloError::Config(format!(
                "Cartesian communicator has {} dimensions, at most 3 are supported",
                layout.dims.len()
            )));
        }
        let mut dims = [1usize; 3];
        let mut periodic = [false; 3];
        for (d, (&n, &p)) in layout.dims.iter().zip(layout.periods.iter()).enumerate() {
            dims[d] = n as usize;
            periodic[d] = p;
        }
        Self::cartesian(comm.rank() as Rank, dims, periodic)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn coords(&self) -> [usize; 3] {
        self.coords
    }

    pub fn is_periodic(&self, axis: Axis) -> bool {
        self.periodic[axis.index()]
    }

    /// Neighbour across the `side` face along `axis`.
    pub fn neighbor(&self, axis: Axis, side: Side) -> Peer {
        self.neighbors[axis.index()][side.index()]
    }

    /// Partners of a transfer displaced by `displacement` (±1) along `axis`:
    /// returns `(source, destination)`, i.e. we receive from `source` and
    /// send to `destination`.
    pub fn shift(&self, axis: Axis, displacement: i32) -> (Peer, Peer) {
        let left = self.neighbor(axis, Side::Left);
        let right = self.neighbor(axis, Side::Right);
        if displacement >= 0 {
            (left, right)
        } else {
            (right, left)
        }
    }

    pub fn coords_of(&self, rank: Rank) -> [usize; 3] {
        coords_in(self.dims, rank)
    }

    pub fn rank_of(&self, coords: [usize; 3]) -> Rank {
        rank_in(self.dims, coords)
    }

    /// Interior cell count and global starting index of this rank's block
    /// along `axis`, splitting `global` cells as evenly as possible. The
    /// lowest coordinates take one extra cell each when the split is uneven.
    pub fn local_extent(&self, axis: Axis, global: usize) -> Result<(usize, usize)> {
        let parts = self.dims[axis.index()];
        if global < parts {
            return Err(HaloError::Config(format!(
                "cannot split {global} cells along {axis} across {parts} ranks"
            )));
        }
        let coord = self.coords[axis.index()];
        let base = global / parts;
        let rem = global % parts;
        let count = base + usize::from(coord < rem);
        let start = coord * base + coord.min(rem);
        Ok((count, start))
    }
}

fn coords_in(dims: [usize; 3], rank: Rank) -> [usize; 3] {
    let c2 = rank % dims[2];
    let rest = rank / dims[2];
    [rest / dims[1], rest % dims[1], c2]
}

fn rank_in(dims: [usize; 3], coords: [usize; 3]) -> Rank {
    (coords[0] * dims[1] + coords[1]) * dims[2] + coords[2]
}

fn neighbor_in(
    dims: [usize; 3],
    periodic: [bool; 3],
    coords: [usize; 3],
    axis: Axis,
    side: Side,
) -> Peer {
    let d = axis.index();
    let n = dims[d];
    let c = coords[d];
    let target = match side {
        Side::Left if c > 0 => c - 1,
        Side::Left if periodic[d] => n - 1,
        Side::Right if c + 1 < n => c + 1,
        Side::Right if periodic[d] => 0,
        _ => return None,
    };
    let mut nc = coords;
    nc[d] = target;
    Some(rank_in(dims, nc))
}

/// Balanced factorization of `nprocs` ranks over `ndims` axes, largest
/// factor first, with trailing axes set to 1.
pub fn dims_create(nprocs: usize, ndims: usize) -> Result<[usize; 3]> {
    if nprocs == 0 || !(1..=3).contains(&ndims) {
        return Err(HaloError::Config(format!(
            "cannot distribute {nprocs} ranks over {ndims} dimensions"
        )));
    }
    let mut factors = Vec::new();
    let mut n = nprocs;
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }

    // Greedy: hand the largest remaining prime to the smallest axis.
    let mut dims = [1usize; 3];
    for &f in factors.iter().rev() {
        let slot = (0..ndims).min_by_key(|&d| dims[d]).unwrap_or(0);
        dims[slot] *= f;
    }
    dims[..ndims].sort_unstable_by(|a, b| b.cmp(a));
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coords_round_trip() {
        let topo = ProcessTopology::cartesian(0, [2, 3, 4], [false; 3]).unwrap();
        for rank in 0..topo.size() {
            assert_eq!(topo.rank_of(topo.coords_of(rank)), rank);
        }
        assert_eq!(topo.coords_of(5), [0, 1, 1]);
    }

    #[test]
    fn non_periodic_edges_have_no_neighbor() {
        let topo = ProcessTopology::cartesian(0, [2, 1, 1], [false; 3]).unwrap();
        assert_eq!(topo.neighbor(Axis::X1, Side::Left), None);
        assert_eq!(topo.neighbor(Axis::X1, Side::Right), Some(1));
        assert_eq!(topo.neighbor(Axis::X2, Side::Left), None);
    }

    #[test]
    fn periodic_axis_wraps() {
        let topo = ProcessTopology::cartesian(1, [2, 1, 1], [true, false, false]).unwrap();
        assert_eq!(topo.neighbor(Axis::X1, Side::Left), Some(0));
        assert_eq!(topo.neighbor(Axis::X1, Side::Right), Some(0));
        let (source, dest) = topo.shift(Axis::X1, 1);
        assert_eq!((source, dest), (Some(0), Some(0)));
    }

    #[test]
    fn shift_matches_sides() {
        let topo = ProcessTopology::cartesian(1, [3, 1, 1], [false; 3]).unwrap();
        assert_eq!(topo.shift(Axis::X1, 1), (Some(0), Some(2)));
        assert_eq!(topo.shift(Axis::X1, -1), (Some(2), Some(0)));
    }

    #[test]
    fn single_periodic_is_self_neighbor() {
        let topo = ProcessTopology::single_periodic();
        for axis in Axis::ALL {
            assert_eq!(topo.shift(axis, 1), (Some(0), Some(0)));
        }
    }

    #[test]
    fn rejects_out_of_range_rank() {
        assert!(ProcessTopology::cartesian(4, [2, 2, 1], [false; 3]).is_err());
        assert!(ProcessTopology::cartesian(0, [0, 2, 1], [false; 3]).is_err());
    }

    #[test]
    fn local_extent_splits_remainder_low() {
        let t0 = ProcessTopology::cartesian(0, [3, 1, 1], [false; 3]).unwrap();
        let t2 = ProcessTopology::cartesian(2, [3, 1, 1], [false; 3]).unwrap();
        assert_eq!(t0.local_extent(Axis::X1, 10).unwrap(), (4, 0));
        assert_eq!(t2.local_extent(Axis::X1, 10).unwrap(), (3, 7));
        assert!(t0.local_extent(Axis::X1, 2).is_err());
    }

    #[test]
    fn dims_create_is_balanced() {
        assert_eq!(dims_create(12, 3).unwrap(), [3, 2, 2]);
        assert_eq!(dims_create(8, 2).unwrap(), [4, 2, 1]);
        assert_eq!(dims_create(7, 1).unwrap(), [7, 1, 1]);
        assert_eq!(dims_create(1, 3).unwrap(), [1, 1, 1]);
        assert!(dims_create(0, 3).is_err());
    }
}
