//! Utility routines.

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    particle::{Particle, ParticleId},
    spatial_index::SpatialIndex,
    types::Vec3,
};

/// Distribute `length` cells into `n` nearly equal parts.
///
/// The first `length % n` parts receive one extra cell. For `length = 10` and `n = 3`
/// the parts are `[4, 3, 3]`.
pub fn split_lengths(length: usize, n: usize) -> Vec<usize> {
    assert!(n > 0);
    let len = length / n;
    let rem = length % n;
    (0..n).map(|index| len + usize::from(index < rem)).collect()
}

/// Compute displacements from a vector of counts.
///
/// Let count `[3, 4, 5]`. Then the corresponding displacements are
/// `[0, 3, 7]`. Note that the last element `5` is ignored.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Boundaries of consecutive parts.
///
/// Like [displacements] but with the total appended, so that part `i` covers
/// the half-open range `[bounds[i], bounds[i + 1])`.
pub fn boundaries(counts: &[usize]) -> Vec<usize> {
    let mut bounds = displacements(counts);
    bounds.push(counts.iter().sum());
    bounds
}

/// Remove repeated entries while keeping the order of first occurrence.
///
/// `[5, 5, 9, 9, 9]` becomes `[5, 9]`.
pub fn dedup_stable<T: Copy + Eq + std::hash::Hash>(values: &[T]) -> Vec<T> {
    values.iter().copied().unique().collect_vec()
}

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Generate a random position strictly inside the analysis domain.
pub fn random_position<R: Rng>(index: &SpatialIndex, rng: &mut R) -> Vec3 {
    let bounds = index.domain_box().coordinates();
    let mut position = [0.0; 3];
    for (axis, value) in position.iter_mut().enumerate() {
        let lower = bounds[axis];
        let upper = bounds[axis + 3];
        // Stay half a cell away from the outer faces.
        let margin = 0.5 * index.pitch()[axis];
        *value = rng.gen_range(lower + margin..upper - margin);
    }
    position
}

/// Generate random particles for testing.
///
/// The particles belong to emitter `(rank, 0)` and are numbered consecutively.
pub fn generate_random_particles<R: Rng>(
    nparticles: usize,
    rank: usize,
    index: &SpatialIndex,
    rng: &mut R,
) -> Vec<Particle> {
    (0..nparticles)
        .map(|sequence| {
            Particle::new(
                ParticleId::new([rank as i32, 0], sequence as i64),
                random_position(index, rng),
                0.0,
                f64::INFINITY,
            )
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::{boundaries, dedup_stable, displacements, split_lengths};

    #[test]
    fn test_split_lengths() {
        assert_eq!(split_lengths(10, 3), vec![4, 3, 3]);
        assert_eq!(split_lengths(8, 2), vec![4, 4]);
        assert_eq!(split_lengths(2, 4), vec![1, 1, 0, 0]);
        assert_eq!(split_lengths(11, 4).iter().sum::<usize>(), 11);
    }

    #[test]
    fn test_displacements_and_boundaries() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(boundaries(&[3, 4, 5]), vec![0, 3, 7, 12]);
    }

    #[test]
    fn test_dedup_stable() {
        assert_eq!(dedup_stable(&[5_i64, 5, 9, 9, 9]), vec![5, 9]);
        assert_eq!(dedup_stable(&[9_i64, 5, 9, 5]), vec![9, 5]);
    }
}
