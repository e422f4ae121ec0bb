//! Scalar types shared across the crate.

/// Global identity of a block.
pub type BlockId = i64;

/// Linear id of a fluid subdomain.
pub type SubDomainId = i32;

/// Message tag used by point to point transfers.
pub type Tag = i32;

/// A point or a vector in three dimensions.
pub type Vec3 = [f64; 3];

/// Flatten a 3d index with `i + j * imax + k * imax * jmax`.
pub fn flatten_index(index: [usize; 3], dims: [usize; 3]) -> usize {
    index[0] + index[1] * dims[0] + index[2] * dims[0] * dims[1]
}

/// Inverse of [flatten_index].
pub fn unflatten_index(linear: usize, dims: [usize; 3]) -> [usize; 3] {
    let plane = dims[0] * dims[1];
    [linear % dims[0], (linear % plane) / dims[0], linear / plane]
}

#[cfg(test)]
mod test {
    use super::{flatten_index, unflatten_index};

    #[test]
    fn test_flatten_roundtrip() {
        let dims = [3, 4, 5];
        for linear in 0..60 {
            assert_eq!(linear, flatten_index(unflatten_index(linear, dims), dims));
        }
        assert_eq!(flatten_index([2, 1, 1], dims), 2 + 3 + 12);
    }
}
