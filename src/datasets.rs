//! Generates the toy regression dataset `y = x1 + 2 * x2^2 + 3 * x3^0.5`

use rand::Rng;

/// Upper bound (exclusive) of every feature; the lower bound is 0 so `x3^0.5` is defined
pub const FEATURE_MAX: f32 = 5.0;

/// Target of the regression for one example
pub fn regression_target(x1: f32, x2: f32, x3: f32) -> f32 {
    x1 + 2.0 * x2.powi(2) + 3.0 * x3.sqrt()
}

/// Samples `n` examples with features drawn uniformly from `[0, FEATURE_MAX)`.
/// Returns the feature rows and the targets, each target as a one-element row.
pub fn gen_regression_data<R: Rng>(
    n: usize,
    rng: &mut R,
) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let mut data = Vec::with_capacity(n);
    let mut targets = Vec::with_capacity(n);

    for _ in 0..n {
        let x1 = rng.random_range(0.0..FEATURE_MAX);
        let x2 = rng.random_range(0.0..FEATURE_MAX);
        let x3 = rng.random_range(0.0..FEATURE_MAX);
        data.push(vec![x1, x2, x3]);
        targets.push(vec![regression_target(x1, x2, x3)]);
    }

    (data, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn test_regression_target() {
        assert_eq_float!(regression_target(1.0, 2.0, 4.0), 1.0 + 8.0 + 6.0);
        assert_eq_float!(regression_target(0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_gen_regression_data() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let (data, targets) = gen_regression_data(100, &mut rng);
        assert_eq!(data.len(), 100);
        assert_eq!(targets.len(), 100);
        for (row, target) in data.iter().zip(targets.iter()) {
            assert_eq!(row.len(), 3);
            assert!(row.iter().all(|&v| (0.0..FEATURE_MAX).contains(&v)));
            assert_eq!(target, &vec![regression_target(row[0], row[1], row[2])]);
        }
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let a = gen_regression_data(10, &mut Pcg64Mcg::seed_from_u64(1));
        let b = gen_regression_data(10, &mut Pcg64Mcg::seed_from_u64(1));
        assert_eq!(a, b);
    }
}
