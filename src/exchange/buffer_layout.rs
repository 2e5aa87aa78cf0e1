//! Linear buffer layout for one axis of a halo exchange.
//!
//! A buffer carries one boundary slab. It is split into sub-blocks laid out
//! back to back: the cell-centered block first (all selected variables),
//! then one block per face-centered component in axis order. Inside a block
//! the index is row-major over `(variable, k, j, i)` relative to the slab
//! origin, `i` fastest.
//!
//! All slab arithmetic lives here so that packing and unpacking read the
//! same description: a block knows its extent, where its slab starts on the
//! transverse axes, and where it starts along the exchange axis for each of
//! the four buffers (send/receive, left/right).

use crate::layout::{Axis, Side, SubdomainLayout};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Selected cell-centered variables.
    Cell,
    /// The face-centered component normal to the given axis.
    Staggered(Axis),
}

/// Axis-aligned box of local indices, addressed by [`Axis::index`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: [usize; 3],
    pub extent: [usize; 3],
}

impl Region {
    pub fn cells(&self) -> usize {
        self.extent.iter().product()
    }

    pub fn contains(&self, i: usize, j: usize, k: usize) -> bool {
        let p = [i, j, k];
        (0..3).all(|d| p[d] >= self.start[d] && p[d] < self.start[d] + self.extent[d])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubBlock {
    pub kind: BlockKind,
    /// Number of stacked components (selected variables for the cell block, 1 otherwise).
    pub components: usize,
    /// Element offset of the block inside the buffer.
    pub offset: usize,
    /// Slab extent per axis.
    pub extent: [usize; 3],
    /// Slab start on the transverse axes; the exchange-axis entry is unused.
    origin: [usize; 3],
    /// Start along the exchange axis of the slab packed into each send buffer.
    send_start: [usize; 2],
    /// Start along the exchange axis of the ghost slab filled from each receive buffer.
    recv_start: [usize; 2],
    axis: Axis,
}

impl SubBlock {
    fn new(layout: &SubdomainLayout, axis: Axis, kind: BlockKind, components: usize) -> Self {
        let a = axis.index();
        let ghost = layout.ghost(axis);
        let mut extent = [0; 3];
        let mut origin = [0; 3];

        for other in Axis::ALL {
            let d = other.index();
            let face = usize::from(kind == BlockKind::Staggered(other));
            if d == a {
                extent[d] = ghost;
            } else if d < a {
                // Already exchanged: carry the ghosts so edges and corners propagate.
                extent[d] = layout.total(other) + face;
            } else {
                origin[d] = layout.begin(other);
                extent[d] = layout.interior(other) + face;
            }
        }

        let begin = layout.begin(axis);
        let end = layout.end(axis);
        let (send_start, recv_start) = if kind == BlockKind::Staggered(axis) {
            // Interface faces `begin` and `end` are owned by both sides and
            // stay untouched: ship the faces just inside them.
            ([begin + 1, end - ghost], [0, end + 1])
        } else {
            ([begin, end - ghost], [0, end])
        };

        Self {
            kind,
            components,
            offset: 0,
            extent,
            origin,
            send_start,
            recv_start,
            axis,
        }
    }

    pub fn len(&self) -> usize {
        self.components * self.extent.iter().product::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn region_at(&self, start: usize) -> Region {
        let mut region = Region {
            start: self.origin,
            extent: self.extent,
        };
        region.start[self.axis.index()] = start;
        region
    }

    /// Slab copied into the send buffer for the neighbour on `side`.
    pub fn pack_region(&self, side: Side) -> Region {
        self.region_at(self.send_start[side.index()])
    }

    /// Ghost slab filled from the buffer received from the neighbour on `side`.
    pub fn unpack_region(&self, side: Side) -> Region {
        self.region_at(self.recv_start[side.index()])
    }

    /// Number of contiguous `i` runs in the block.
    pub fn rows(&self) -> usize {
        self.components * self.extent[1] * self.extent[2]
    }

    /// Buffer position of element `(n, k, j, i)` relative to the slab origin.
    pub fn buffer_index(&self, n: usize, k: usize, j: usize, i: usize) -> usize {
        let [nx, ny, nz] = self.extent;
        self.offset + i + nx * (j + ny * (k + nz * n))
    }

    /// Inverse of the row part of [`SubBlock::buffer_index`]: `(n, k, j)` of
    /// the `row`-th run of `i` values in the block.
    pub fn row_coords(&self, row: usize) -> (usize, usize, usize) {
        let ny = self.extent[1];
        let nz = self.extent[2];
        let j = row % ny;
        let rest = row / ny;
        (rest / nz, rest % nz, j)
    }
}

/// Buffer description for exchanges along one axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxisBufferLayout {
    pub axis: Axis,
    pub blocks: Vec<SubBlock>,
    len: usize,
}

impl AxisBufferLayout {
    pub fn new(layout: &SubdomainLayout, axis: Axis, nvar: usize, staggered: bool) -> Self {
        let mut blocks = vec![SubBlock::new(layout, axis, BlockKind::Cell, nvar)];
        if staggered {
            for component in layout.active_axes() {
                blocks.push(SubBlock::new(layout, axis, BlockKind::Staggered(component), 1));
            }
        }
        let mut len = 0;
        for block in &mut blocks {
            block.offset = len;
            len += block.len();
        }
        Self { axis, blocks, len }
    }

    /// Element count of each of the four buffers along this axis.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cell_block(&self) -> &SubBlock {
        &self.blocks[0]
    }

    pub fn staggered_block(&self, component: Axis) -> Option<&SubBlock> {
        self.blocks
            .iter()
            .find(|b| b.kind == BlockKind::Staggered(component))
    }
}

/// Buffer layouts for every active axis of a subdomain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    axes: Vec<AxisBufferLayout>,
}

impl BufferLayout {
    pub fn new(layout: &SubdomainLayout, nvar: usize, staggered: bool) -> Self {
        let axes = layout
            .active_axes()
            .map(|axis| AxisBufferLayout::new(layout, axis, nvar, staggered))
            .collect();
        Self { axes }
    }

    /// Layout for `axis`, or `None` if the axis is not active.
    pub fn axis(&self, axis: Axis) -> Option<&AxisBufferLayout> {
        self.axes.get(axis.index())
    }

    /// Buffer element count for `axis` (0 for inactive axes).
    pub fn len(&self, axis: Axis) -> usize {
        self.axis(axis).map_or(0, AxisBufferLayout::len)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AxisBufferLayout> {
        self.axes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_dimensional_sizes() {
        let layout = SubdomainLayout::uniform(1, 2, [8, 1, 1]).unwrap();
        let cell_only = BufferLayout::new(&layout, 3, false);
        assert_eq!(cell_only.len(Axis::X1), 2 * 3);
        assert_eq!(cell_only.len(Axis::X2), 0);

        let with_faces = BufferLayout::new(&layout, 3, true);
        assert_eq!(with_faces.len(Axis::X1), 2 * 3 + 2);
    }

    #[test]
    fn two_dimensional_sizes() {
        // interior 8x6, ghost 2: totals 12x10
        let layout = SubdomainLayout::uniform(2, 2, [8, 6, 1]).unwrap();
        let bl = BufferLayout::new(&layout, 4, true);
        // X1: cells 2*6*4, normal faces 2*6, X2 faces 2*(6+1)
        assert_eq!(bl.len(Axis::X1), 48 + 12 + 14);
        // X2: cells 12*2*4, X1 faces (12+1)*2, normal faces 12*2
        assert_eq!(bl.len(Axis::X2), 96 + 26 + 24);
        assert_eq!(bl.len(Axis::X3), 0);

        let cells = BufferLayout::new(&layout, 4, false);
        assert_eq!(cells.len(Axis::X1), 48);
        assert_eq!(cells.len(Axis::X2), 96);
    }

    #[test]
    fn three_dimensional_sizes() {
        // interior 4x3x2, ghost 1: totals 6x5x4
        let layout = SubdomainLayout::uniform(3, 1, [4, 3, 2]).unwrap();
        let bl = BufferLayout::new(&layout, 2, true);
        assert_eq!(bl.len(Axis::X1), 12 + 6 + 8 + 9);
        assert_eq!(bl.len(Axis::X2), 24 + 14 + 12 + 18);
        assert_eq!(bl.len(Axis::X3), 60 + 35 + 36 + 30);
    }

    #[test]
    fn first_axis_matches_interior_formula() {
        let layout = SubdomainLayout::new(3, [3, 2, 1], [7, 5, 4]).unwrap();
        let bl = BufferLayout::new(&layout, 5, false);
        assert_eq!(bl.len(Axis::X1), 3 * 5 * 4 * 5);
    }

    #[test]
    fn blocks_are_back_to_back() {
        let layout = SubdomainLayout::uniform(3, 2, [6, 5, 4]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X2, 3, true);
        let kinds: Vec<_> = axis.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::Cell,
                BlockKind::Staggered(Axis::X1),
                BlockKind::Staggered(Axis::X2),
                BlockKind::Staggered(Axis::X3),
            ]
        );
        let mut expected = 0;
        for block in &axis.blocks {
            assert_eq!(block.offset, expected);
            expected += block.len();
        }
        assert_eq!(expected, axis.len());
    }

    #[test]
    fn cell_slabs_along_exchange_axis() {
        let layout = SubdomainLayout::uniform(2, 2, [8, 6, 1]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X1, 1, false);
        let block = axis.cell_block();
        assert_eq!(block.pack_region(Side::Left).start, [2, 2, 0]);
        assert_eq!(block.pack_region(Side::Right).start, [8, 2, 0]);
        assert_eq!(block.unpack_region(Side::Left).start, [0, 2, 0]);
        assert_eq!(block.unpack_region(Side::Right).start, [10, 2, 0]);
        assert_eq!(block.extent, [2, 6, 1]);
    }

    #[test]
    fn normal_faces_skip_the_interface() {
        let layout = SubdomainLayout::uniform(2, 2, [8, 6, 1]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X1, 1, true);
        let normal = axis.staggered_block(Axis::X1).unwrap();
        // begin = 2, end = 10
        assert_eq!(normal.pack_region(Side::Left).start[0], 3);
        assert_eq!(normal.pack_region(Side::Right).start[0], 8);
        assert_eq!(normal.unpack_region(Side::Left).start[0], 0);
        assert_eq!(normal.unpack_region(Side::Right).start[0], 11);
        let unpacked = normal.unpack_region(Side::Right);
        assert!(!unpacked.contains(10, 2, 0));

        let transverse = axis.staggered_block(Axis::X2).unwrap();
        assert_eq!(transverse.extent, [2, 7, 1]);
        assert_eq!(transverse.pack_region(Side::Left).start, [2, 2, 0]);
    }

    #[test]
    fn later_axes_span_earlier_ghosts() {
        let layout = SubdomainLayout::uniform(3, 1, [4, 3, 2]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X3, 1, true);
        let cell = axis.cell_block();
        assert_eq!(cell.extent, [6, 5, 1]);
        assert_eq!(cell.pack_region(Side::Left).start, [0, 0, 1]);
        let x1_faces = axis.staggered_block(Axis::X1).unwrap();
        assert_eq!(x1_faces.extent, [7, 5, 1]);
    }

    #[test]
    fn buffer_index_is_row_major() {
        let layout = SubdomainLayout::uniform(2, 2, [8, 6, 1]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X1, 2, false);
        let block = axis.cell_block();
        assert_eq!(block.buffer_index(0, 0, 0, 1), 1);
        assert_eq!(block.buffer_index(0, 0, 1, 0), 2);
        assert_eq!(block.buffer_index(1, 0, 0, 0), 12);
        assert_eq!(block.rows(), 12);
        assert_eq!(block.row_coords(7), (1, 0, 1));
    }
}
