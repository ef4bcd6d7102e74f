//! Body fixtures used in tests and benchmarks.
use rand::distributions::uniform::SampleUniform;
use rand::prelude::*;

use crate::traits::general::{FmmScalar, RealScalar};
use crate::tree::types::Body;

/// Body fixture, uniformly sampled in each axis from `min` to `max` (unit
/// cube when unspecified) with unit strengths and identities `0..n`.
///
/// # Arguments
/// * `n` - The number of bodies to sample.
/// * `min` - The minimum coordinate value along each axis.
/// * `max` - The maximum coordinate value along each axis.
/// * `seed` - Random seed.
pub fn points_fixture<T, V>(
    n: usize,
    min: Option<T>,
    max: Option<T>,
    seed: Option<u64>,
) -> Vec<Body<T, V>>
where
    T: RealScalar + SampleUniform,
    V: FmmScalar<T>,
{
    let seed = seed.unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);

    let between = if let (Some(min), Some(max)) = (min, max) {
        rand::distributions::Uniform::from(min..max)
    } else {
        rand::distributions::Uniform::from(T::zero()..T::one())
    };

    (0..n)
        .map(|i| {
            let x = [
                between.sample(&mut rng),
                between.sample(&mut rng),
                between.sample(&mut rng),
            ];
            Body::new(x, V::one(), i)
        })
        .collect()
}

/// Overwrite source strengths with random values of magnitude ~1/n whose sum
/// vanishes, the standard neutral-charge initialization for periodic and
/// accuracy runs.
pub fn zero_mean_charges<T, V>(bodies: &mut [Body<T, V>], seed: u64)
where
    T: RealScalar + SampleUniform,
    V: FmmScalar<T>,
{
    if bodies.is_empty() {
        return;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let half = T::from(0.5).unwrap();
    let n = T::from(bodies.len()).unwrap();
    let between = rand::distributions::Uniform::from(T::zero()..T::one());

    let mut average = T::zero();
    for body in bodies.iter_mut() {
        let src = (between.sample(&mut rng) - half) / n;
        body.src = V::from_re_im(src, T::zero());
        average += src;
    }
    average /= n;
    for body in bodies.iter_mut() {
        body.src -= V::from_re_im(average, T::zero());
    }
}
