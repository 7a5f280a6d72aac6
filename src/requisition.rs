//! Buffer shape descriptor.

use std::fmt;

/// Maximum rank a [`Requisition`] may carry.
pub const MAX_NDIMS: usize = 8;

/// An immutable shape tuple `(n_dims, dims[0..n_dims])`.
///
/// Invariants: `1 <= n_dims <= MAX_NDIMS` and every `dims[i] >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Requisition {
    n_dims: usize,
    dims: [usize; MAX_NDIMS],
}

impl Requisition {
    /// Builds a requisition from a slice of per-dimension sizes.
    ///
    /// # Panics
    ///
    /// Panics if `dims` is empty, longer than [`MAX_NDIMS`], or contains a
    /// zero-sized dimension. Requisitions are assembled at pipeline-setup
    /// time from filter-supplied shapes, not from untrusted input, so a
    /// panic here signals a filter author bug rather than a runtime
    /// condition callers need to recover from.
    pub fn new(dims: &[usize]) -> Requisition {
        assert!(!dims.is_empty(), "Requisition::new: n_dims must be >= 1");
        assert!(
            dims.len() <= MAX_NDIMS,
            "Requisition::new: n_dims {} exceeds MAX_NDIMS {}",
            dims.len(),
            MAX_NDIMS
        );
        assert!(
            dims.iter().all(|&d| d >= 1),
            "Requisition::new: all dimensions must be >= 1"
        );

        let mut stored = [1usize; MAX_NDIMS];
        stored[..dims.len()].copy_from_slice(dims);

        Requisition {
            n_dims: dims.len(),
            dims: stored,
        }
    }

    /// Number of dimensions (rank).
    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// Per-dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.n_dims]
    }

    /// Total number of float32 elements, i.e. the product of all dimensions.
    pub fn len(&self) -> usize {
        self.dims().iter().product()
    }

    /// Byte size of the backing storage (`4 * len()`, float32 elements).
    pub fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }

    /// Signed sum of per-dimension differences against `other`.
    ///
    /// Positive when `other` is larger dimension-for-dimension, negative
    /// when smaller, zero when equal. Used by the scheduler to decide
    /// whether a recycled buffer needs resizing before reuse.
    pub fn cmp_dimensions(&self, other: &Requisition) -> i64 {
        let n = self.n_dims.max(other.n_dims);
        let mut acc: i64 = 0;
        for i in 0..n {
            let a = *self.dims.get(i).unwrap_or(&1) as i64;
            let b = *other.dims.get(i).unwrap_or(&1) as i64;
            acc += b - a;
        }
        acc
    }
}

impl fmt::Display for Requisition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims().iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_and_size() {
        let req = Requisition::new(&[4, 4]);
        assert_eq!(req.len(), 16);
        assert_eq!(req.size_bytes(), 64);
        assert_eq!(req.n_dims(), 2);
    }

    #[test]
    fn cmp_dimensions_signed_sum() {
        let small = Requisition::new(&[2, 2]);
        let big = Requisition::new(&[4, 4]);
        assert!(small.cmp_dimensions(&big) > 0);
        assert!(big.cmp_dimensions(&small) < 0);
        assert_eq!(small.cmp_dimensions(&small.clone()), 0);
    }

    #[test]
    #[should_panic]
    fn rejects_zero_dim() {
        Requisition::new(&[4, 0]);
    }

    #[test]
    #[should_panic]
    fn rejects_too_many_dims() {
        Requisition::new(&[1; MAX_NDIMS + 1]);
    }
}
