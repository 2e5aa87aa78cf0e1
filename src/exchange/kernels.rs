//! Pack and unpack kernels.
//!
//! Packing copies the boundary slabs described by an [`AxisBufferLayout`]
//! out of the field arrays into the two send buffers; unpacking copies the
//! two receive buffers into the ghost slabs. Both move whole `i` runs, which
//! are contiguous in the field and in the buffer alike.

use crate::error::{HaloError, Result};
use crate::field::Field4;
use crate::layout::Side;
use crate::Real;

use super::buffer_layout::{AxisBufferLayout, BlockKind, SubBlock};
use super::device::Device;

/// Fields taking part in an exchange.
pub struct FieldSet<'a> {
    pub cell: &'a mut Field4,
    pub staggered: Option<&'a mut Field4>,
}

/// Cell-centered variables to exchange, in buffer order.
#[derive(Clone, Debug)]
pub(crate) struct VariableMap {
    /// `indices[n]` is the field component stored as block component `n`.
    indices: Vec<usize>,
}

impl VariableMap {
    pub(crate) fn new(indices: &[usize]) -> Self {
        Self {
            indices: indices.to_vec(),
        }
    }

    /// Field component holding component `n` of `block`.
    fn field_component(&self, block: &SubBlock, n: usize) -> usize {
        match block.kind {
            BlockKind::Cell => self.indices[n],
            BlockKind::Staggered(c) => c.index(),
        }
    }
}

fn field_for<'f>(block: &SubBlock, fields: &'f FieldSet<'_>) -> Result<&'f Field4> {
    match block.kind {
        BlockKind::Cell => Ok(&*fields.cell),
        BlockKind::Staggered(_) => fields.staggered.as_deref().ok_or_else(|| {
            HaloError::Config("channel exchanges face-centered data but no staggered field was given".into())
        }),
    }
}

/// Copy the boundary slabs of every block into `send[Left]` and `send[Right]`.
pub(crate) fn pack(
    device: &Device,
    layout: &AxisBufferLayout,
    vars: &VariableMap,
    fields: &FieldSet<'_>,
    send: &mut [Vec<Real>; 2],
) -> Result<()> {
    for block in &layout.blocks {
        let field = field_for(block, fields)?;
        let data = field.as_slice();
        let nx = block.extent[0];
        for side in Side::BOTH {
            let region = block.pack_region(side);
            let out = &mut send[side.index()][block.offset..block.offset + block.len()];
            device.for_each_row("pack", out, nx, |row, chunk| {
                let (n, k, j) = block.row_coords(row);
                let src = field.offset(
                    vars.field_component(block, n),
                    region.start[2] + k,
                    region.start[1] + j,
                    region.start[0],
                );
                chunk.copy_from_slice(&data[src..src + nx]);
            });
        }
    }
    Ok(())
}

/// Copy `recv[side]` into the ghost slabs of every side flagged in `filled`.
///
/// Sides without a neighbour are skipped so their ghosts keep whatever the
/// boundary conditions put there.
pub(crate) fn unpack(
    device: &Device,
    layout: &AxisBufferLayout,
    vars: &VariableMap,
    fields: &mut FieldSet<'_>,
    recv: &[Vec<Real>; 2],
    filled: [bool; 2],
) -> Result<()> {
    let (cell_blocks, face_blocks): (Vec<&SubBlock>, Vec<&SubBlock>) = layout
        .blocks
        .iter()
        .partition(|b| b.kind == BlockKind::Cell);

    unpack_into(device, &cell_blocks, vars, fields.cell, recv, filled);
    if !face_blocks.is_empty() {
        let staggered = fields.staggered.as_deref_mut().ok_or_else(|| {
            HaloError::Config("channel exchanges face-centered data but no staggered field was given".into())
        })?;
        unpack_into(device, &face_blocks, vars, staggered, recv, filled);
    }
    Ok(())
}

/// One run of `nx` ghost values: `recv[side][src..]` lands at `i0` of a field row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct GhostRun {
    side: usize,
    src: usize,
    i0: usize,
    nx: usize,
}

/// Every ghost run `blocks` write into a field of `shape`, keyed by field
/// row and sorted by it. Along X1 both sides share rows.
fn ghost_runs(
    blocks: &[&SubBlock],
    vars: &VariableMap,
    shape: [usize; 4],
    filled: [bool; 2],
) -> Vec<(usize, GhostRun)> {
    let row_of = |v: usize, k: usize, j: usize| (v * shape[1] + k) * shape[2] + j;
    let mut runs = Vec::new();
    for block in blocks {
        let [nx, ny, nz] = block.extent;
        for side in Side::BOTH.into_iter().filter(|s| filled[s.index()]) {
            let region = block.unpack_region(side);
            for n in 0..block.components {
                let v = vars.field_component(block, n);
                for k in 0..nz {
                    for j in 0..ny {
                        let row = row_of(v, region.start[2] + k, region.start[1] + j);
                        runs.push((
                            row,
                            GhostRun {
                                side: side.index(),
                                src: block.buffer_index(n, k, j, 0),
                                i0: region.start[0],
                                nx,
                            },
                        ));
                    }
                }
            }
        }
    }
    runs.sort_by_key(|&(row, _)| row);
    runs
}

fn unpack_into(
    device: &Device,
    blocks: &[&SubBlock],
    vars: &VariableMap,
    field: &mut Field4,
    recv: &[Vec<Real>; 2],
    filled: [bool; 2],
) {
    let runs = ghost_runs(blocks, vars, field.shape(), filled);
    let row_len = field.row_len();

    // Carve the touched rows out of the field as disjoint slices.
    let mut rows: Vec<(&mut [Real], &[(usize, GhostRun)])> = Vec::new();
    let mut rest = field.as_mut_slice();
    let mut next_row = 0;
    for group in runs.chunk_by(|a, b| a.0 == b.0) {
        let row = group[0].0;
        let (_, tail) = std::mem::take(&mut rest).split_at_mut((row - next_row) * row_len);
        let (chunk, tail) = tail.split_at_mut(row_len);
        rows.push((chunk, group));
        rest = tail;
        next_row = row + 1;
    }

    device.for_each_task("unpack", rows, |(chunk, group)| {
        for (_, run) in group {
            let src = &recv[run.side][run.src..run.src + run.nx];
            chunk[run.i0..run.i0 + run.nx].copy_from_slice(src);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Axis, SubdomainLayout};

    fn encode(n: usize, k: usize, j: usize, i: usize) -> Real {
        (n * 1_000_000 + k * 10_000 + j * 100 + i) as Real
    }

    #[test]
    fn pack_reads_slabs_next_to_each_ghost_region() {
        let layout = SubdomainLayout::uniform(2, 2, [6, 4, 1]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X1, 2, false);
        let vars = VariableMap::new(&[1, 0]);
        let mut cell = Field4::cell_centered(&layout, 2);
        cell.fill_with(encode);
        let fields = FieldSet {
            cell: &mut cell,
            staggered: None,
        };
        let mut send = [vec![0.0; axis.len()], vec![0.0; axis.len()]];
        pack(&Device::serial(), &axis, &vars, &fields, &mut send).unwrap();

        let block = axis.cell_block();
        // Block component 0 is field variable 1; left slab starts at i = begin = 2.
        assert_eq!(send[0][block.buffer_index(0, 0, 0, 0)], encode(1, 0, 2, 2));
        assert_eq!(send[0][block.buffer_index(1, 0, 3, 1)], encode(0, 0, 5, 3));
        // Right slab starts at end - ghost = 6.
        assert_eq!(send[1][block.buffer_index(0, 0, 0, 0)], encode(1, 0, 2, 6));
    }

    #[test]
    fn unpack_respects_filled_mask() {
        let layout = SubdomainLayout::uniform(1, 2, [4, 1, 1]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X1, 1, false);
        let vars = VariableMap::new(&[0]);
        let mut cell = Field4::filled(layout.cell_shape(1), -1.0);
        let recv = [vec![10.0, 11.0], vec![20.0, 21.0]];
        let mut fields = FieldSet {
            cell: &mut cell,
            staggered: None,
        };
        unpack(&Device::serial(), &axis, &vars, &mut fields, &recv, [false, true]).unwrap();
        assert_eq!(cell.as_slice(), &[-1.0, -1.0, -1.0, -1.0, -1.0, -1.0, 20.0, 21.0]);
    }

    #[test]
    fn unpack_visits_only_ghost_rows() {
        // interior 4x3x2, ghost 1: totals 6x5x4
        let layout = SubdomainLayout::uniform(3, 1, [4, 3, 2]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X3, 2, false);
        let vars = VariableMap::new(&[1, 0]);
        let blocks: Vec<&SubBlock> = axis.blocks.iter().collect();
        let shape = layout.cell_shape(2);

        let runs = ghost_runs(&blocks, &vars, shape, [true, true]);
        // two components, one k plane, 5 rows of j, both sides
        assert_eq!(runs.len(), 2 * 5 * 2);
        assert!(runs.windows(2).all(|w| w[0].0 <= w[1].0));
        for &(row, _) in &runs {
            let k = (row / shape[2]) % shape[1];
            assert!(k == 0 || k == 3, "row {row} is not a ghost plane");
        }
        assert_eq!(ghost_runs(&blocks, &vars, shape, [false, true]).len(), 10);
    }

    #[test]
    fn unpack_fills_both_sides_of_shared_rows() {
        let layout = SubdomainLayout::uniform(2, 1, [3, 2, 1]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X1, 1, false);
        let vars = VariableMap::new(&[0]);
        let mut cell = Field4::filled(layout.cell_shape(1), -1.0);
        let recv = [vec![10.0, 11.0], vec![20.0, 21.0]];
        let mut fields = FieldSet {
            cell: &mut cell,
            staggered: None,
        };
        unpack(&Device::rayon(2).unwrap(), &axis, &vars, &mut fields, &recv, [true, true]).unwrap();
        assert_eq!(cell.get(0, 0, 1, 0), 10.0);
        assert_eq!(cell.get(0, 0, 1, 4), 20.0);
        assert_eq!(cell.get(0, 0, 2, 0), 11.0);
        assert_eq!(cell.get(0, 0, 2, 4), 21.0);
        assert_eq!(cell.get(0, 0, 0, 0), -1.0);
        assert_eq!(cell.get(0, 0, 2, 2), -1.0);
    }

    #[test]
    fn missing_staggered_field_is_a_config_error() {
        let layout = SubdomainLayout::uniform(1, 1, [4, 1, 1]).unwrap();
        let axis = AxisBufferLayout::new(&layout, Axis::X1, 1, true);
        let vars = VariableMap::new(&[0]);
        let mut cell = Field4::cell_centered(&layout, 1);
        let fields = FieldSet {
            cell: &mut cell,
            staggered: None,
        };
        let mut send = [vec![0.0; axis.len()], vec![0.0; axis.len()]];
        let err = pack(&Device::serial(), &axis, &vars, &fields, &mut send).unwrap_err();
        assert!(matches!(err, HaloError::Config(_)));
    }
}
