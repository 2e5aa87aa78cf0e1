//! Deterministic global test pattern for checking ghost cells.
//!
//! Every interior cell (and face) gets a value that is a unique function of
//! its global index. After an exchange, a ghost entry must hold the value of
//! the global cell it mirrors, wrapped on periodic axes, or still hold
//! [`UNTOUCHED`] where it lies outside a non-periodic domain.

use crate::field::Field4;
use crate::layout::{Axis, SubdomainLayout};
use crate::Real;

/// Value written to every non-interior entry before exchanging.
pub const UNTOUCHED: Real = -1.0e30;

#[derive(Clone, Debug)]
pub struct GlobalPattern {
    layout: SubdomainLayout,
    start: [usize; 3],
    global: [usize; 3],
    periodic: [bool; 3],
}

/// A ghost entry holding the wrong value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mismatch {
    pub index: [usize; 4],
    pub expected: Real,
    pub found: Real,
}

impl GlobalPattern {
    /// `start` is the global index of the first interior cell on each axis.
    pub fn new(
        layout: SubdomainLayout,
        start: [usize; 3],
        global: [usize; 3],
        periodic: [bool; 3],
    ) -> Self {
        Self {
            layout,
            start,
            global,
            periodic,
        }
    }

    fn encode(&self, n: usize, g: [usize; 3]) -> Real {
        let [g1, g2, g3] = self.global;
        let linear = ((n * (g3 + 1) + g[2]) * (g2 + 1) + g[1]) * (g1 + 1) + g[0];
        linear as Real + 1.0
    }

    fn global_of(&self, axis: Axis, local: usize) -> isize {
        if !self.layout.is_active(axis) {
            return 0;
        }
        (self.start[axis.index()] + local) as isize - self.layout.ghost(axis) as isize
    }

    /// Global cell index along `axis`, wrapped if periodic, or `None` when
    /// it falls outside a non-periodic domain.
    fn cell_index(&self, axis: Axis, local: usize) -> Option<usize> {
        let g = self.global_of(axis, local);
        let n = self.global[axis.index()] as isize;
        if (0..n).contains(&g) {
            Some(g as usize)
        } else if self.periodic[axis.index()] {
            Some(g.rem_euclid(n) as usize)
        } else {
            None
        }
    }

    /// Like [`GlobalPattern::cell_index`] for a face index; face `n` of a
    /// periodic axis is face 0.
    fn face_index(&self, axis: Axis, local: usize) -> Option<usize> {
        let g = self.global_of(axis, local);
        let n = self.global[axis.index()] as isize;
        if self.periodic[axis.index()] {
            Some(g.rem_euclid(n) as usize)
        } else if (0..=n).contains(&g) {
            Some(g as usize)
        } else {
            None
        }
    }

    /// Expected value of cell `(n, k, j, i)` after a full exchange.
    pub fn expected_cell(&self, n: usize, k: usize, j: usize, i: usize) -> Real {
        let local = [i, j, k];
        let mut g = [0; 3];
        for axis in Axis::ALL {
            match self.cell_index(axis, local[axis.index()]) {
                Some(v) => g[axis.index()] = v,
                None => return UNTOUCHED,
            }
        }
        self.encode(n, g)
    }

    /// Expected value of face component `c` at `(k, j, i)`, or `None` for
    /// the padding slots a component carries along the axes it is not
    /// staggered on.
    pub fn expected_face(&self, c: usize, k: usize, j: usize, i: usize) -> Option<Real> {
        let local = [i, j, k];
        let mut g = [0; 3];
        for axis in Axis::ALL {
            let d = axis.index();
            let l = local[d];
            let index = if d == c {
                self.face_index(axis, l)
            } else {
                if l >= self.layout.total(axis) {
                    return None;
                }
                self.cell_index(axis, l)
            };
            match index {
                Some(v) => g[d] = v,
                None => return Some(UNTOUCHED),
            }
        }
        // Offset face values away from cell values.
        Some(-self.encode(c, g))
    }

    fn is_interior(&self, local: [usize; 3], face_axis: Option<usize>) -> bool {
        Axis::ALL.iter().all(|&axis| {
            let d = axis.index();
            let hi = self.layout.end(axis) + usize::from(face_axis == Some(d));
            local[d] >= self.layout.begin(axis) && local[d] < hi
        })
    }

    /// Write the pattern into the interior and [`UNTOUCHED`] everywhere else.
    pub fn init_cells(&self, field: &mut Field4) {
        field.fill_with(|n, k, j, i| {
            if self.is_interior([i, j, k], None) {
                self.expected_cell(n, k, j, i)
            } else {
                UNTOUCHED
            }
        });
    }

    /// Face counterpart of [`GlobalPattern::init_cells`]: both interface
    /// faces of the interior count as owned.
    pub fn init_faces(&self, field: &mut Field4) {
        field.fill_with(|c, k, j, i| {
            if self.is_interior([i, j, k], Some(c)) {
                self.expected_face(c, k, j, i).unwrap_or(UNTOUCHED)
            } else {
                UNTOUCHED
            }
        });
    }

    /// Every entry of the selected components that disagrees with the pattern.
    pub fn check_cells(&self, field: &Field4, variables: &[usize]) -> Vec<Mismatch> {
        let [_, nk, nj, ni] = field.shape();
        let mut bad = Vec::new();
        for &n in variables {
            for k in 0..nk {
                for j in 0..nj {
                    for i in 0..ni {
                        let expected = self.expected_cell(n, k, j, i);
                        let found = field.get(n, k, j, i);
                        if found != expected {
                            bad.push(Mismatch {
                                index: [n, k, j, i],
                                expected,
                                found,
                            });
                        }
                    }
                }
            }
        }
        bad
    }

    pub fn check_faces(&self, field: &Field4) -> Vec<Mismatch> {
        let [nc, nk, nj, ni] = field.shape();
        let mut bad = Vec::new();
        for c in 0..nc {
            for k in 0..nk {
                for j in 0..nj {
                    for i in 0..ni {
                        let Some(expected) = self.expected_face(c, k, j, i) else {
                            continue;
                        };
                        let found = field.get(c, k, j, i);
                        if found != expected {
                            bad.push(Mismatch {
                                index: [c, k, j, i],
                                expected,
                                found,
                            });
                        }
                    }
                }
            }
        }
        bad
    }
}
