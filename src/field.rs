//! Dense 4-D field storage shared with the solver.
//!
//! Layout is row-major over `(component, k, j, i)`, so a run of `i` values at
//! fixed `(component, k, j)` is contiguous. The exchange kernels rely on this
//! to move whole rows at a time.

use std::ops::{Index, IndexMut};

use crate::layout::SubdomainLayout;
use crate::Real;

#[derive(Debug, Clone, PartialEq)]
pub struct Field4 {
    shape: [usize; 4],
    data: Vec<Real>,
}

impl Field4 {
    pub fn filled(shape: [usize; 4], value: Real) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
        }
    }

    pub fn zeros(shape: [usize; 4]) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Cell-centered array with `nvar` components sized for `layout`.
    pub fn cell_centered(layout: &SubdomainLayout, nvar: usize) -> Self {
        Self::zeros(layout.cell_shape(nvar))
    }

    /// Face-centered array (one component per active axis) sized for `layout`.
    pub fn staggered(layout: &SubdomainLayout) -> Self {
        Self::zeros(layout.staggered_shape())
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of one contiguous `i` row.
    pub fn row_len(&self) -> usize {
        self.shape[3]
    }

    /// Linear offset of `(n, k, j, i)`.
    #[inline]
    pub fn offset(&self, n: usize, k: usize, j: usize, i: usize) -> usize {
        debug_assert!(n < self.shape[0] && k < self.shape[1] && j < self.shape[2] && i < self.shape[3]);
        ((n * self.shape[1] + k) * self.shape[2] + j) * self.shape[3] + i
    }

    /// Index of the `i` row holding `(n, k, j, *)`.
    #[inline]
    pub fn row_index(&self, n: usize, k: usize, j: usize) -> usize {
        (n * self.shape[1] + k) * self.shape[2] + j
    }

    /// Inverse of [`Field4::row_index`].
    #[inline]
    pub fn row_coords(&self, row: usize) -> (usize, usize, usize) {
        let j = row % self.shape[2];
        let rest = row / self.shape[2];
        (rest / self.shape[1], rest % self.shape[1], j)
    }

    pub fn get(&self, n: usize, k: usize, j: usize, i: usize) -> Real {
        self.data[self.offset(n, k, j, i)]
    }

    pub fn set(&mut self, n: usize, k: usize, j: usize, i: usize, value: Real) {
        let idx = self.offset(n, k, j, i);
        self.data[idx] = value;
    }

    /// Fill every entry from a function of its `(n, k, j, i)` coordinates.
    pub fn fill_with(&mut self, mut f: impl FnMut(usize, usize, usize, usize) -> Real) {
        let [nn, nk, nj, ni] = self.shape;
        let mut idx = 0;
        for n in 0..nn {
            for k in 0..nk {
                for j in 0..nj {
                    for i in 0..ni {
                        self.data[idx] = f(n, k, j, i);
                        idx += 1;
                    }
                }
            }
        }
    }

    pub fn as_slice(&self) -> &[Real] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [Real] {
        &mut self.data
    }
}

impl Index<[usize; 4]> for Field4 {
    type Output = Real;

    fn index(&self, [n, k, j, i]: [usize; 4]) -> &Real {
        &self.data[self.offset(n, k, j, i)]
    }
}

impl IndexMut<[usize; 4]> for Field4 {
    fn index_mut(&mut self, [n, k, j, i]: [usize; 4]) -> &mut Real {
        let idx = self.offset(n, k, j, i);
        &mut self.data[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_row_major() {
        let f = Field4::zeros([2, 3, 4, 5]);
        assert_eq!(f.len(), 120);
        assert_eq!(f.offset(0, 0, 0, 1), 1);
        assert_eq!(f.offset(0, 0, 1, 0), 5);
        assert_eq!(f.offset(0, 1, 0, 0), 20);
        assert_eq!(f.offset(1, 0, 0, 0), 60);
    }

    #[test]
    fn row_index_round_trips() {
        let f = Field4::zeros([2, 3, 4, 5]);
        let row = f.row_index(1, 2, 3);
        assert_eq!(row * f.row_len(), f.offset(1, 2, 3, 0));
        assert_eq!(f.row_coords(row), (1, 2, 3));
    }

    #[test]
    fn fill_with_visits_every_entry() {
        let mut f = Field4::zeros([1, 2, 2, 3]);
        f.fill_with(|n, k, j, i| (n * 1000 + k * 100 + j * 10 + i) as Real);
        assert_eq!(f[[0, 1, 1, 2]], 112.0);
        f[[0, 0, 1, 0]] = -1.0;
        assert_eq!(f.get(0, 0, 1, 0), -1.0);
    }
}
