use rand::rngs::StdRng;
use rand::SeedableRng;

/// Cap `subset` at `cap` items by uniform sampling without replacement.
///
/// A subset that already fits is returned unchanged. Sampled items keep their
/// relative input order. With `seed = None` the generator is seeded from OS
/// entropy and the selection differs between runs.
pub fn downsample<T: Copy>(subset: &[T], cap: usize, seed: Option<u64>) -> Vec<T> {
    if subset.len() <= cap {
        return subset.to_vec();
    }
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let mut picked = rand::seq::index::sample(&mut rng, subset.len(), cap).into_vec();
    picked.sort_unstable();
    picked.into_iter().map(|i| subset[i]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_when_under_cap() {
        let data: Vec<u32> = (0..10).collect();
        assert_eq!(downsample(&data, 10, None), data);
        assert_eq!(downsample(&data, 50, Some(1)), data);
        assert!(downsample::<u32>(&[], 5, None).is_empty());
    }

    #[test]
    fn exact_cap_without_replacement() {
        let data: Vec<u32> = (0..1_000).collect();
        let out = downsample(&data, 100, None);
        assert_eq!(out.len(), 100);
        let unique: HashSet<u32> = out.iter().copied().collect();
        assert_eq!(unique.len(), 100);
        assert!(out.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let data: Vec<u32> = (0..5_000).collect();
        let a = downsample(&data, 250, Some(42));
        let b = downsample(&data, 250, Some(42));
        assert_eq!(a, b);
        let c = downsample(&data, 250, Some(43));
        assert_ne!(a, c);
    }
}
