use fnv::FnvHashMap as HashMap;
use rand::prelude::SliceRandom;
use std::hash::Hash;
use std::ops::Range;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., well assignment)
/// # Returns
/// A vector of (group, indexes) pairs in order of first appearance.
/// Indexes within each group keep their original order.
pub fn partition_by_membership<T>(membership: &[T]) -> Vec<(T, Vec<usize>)>
where
    T: Eq + Hash + Clone,
{
    let mut position: HashMap<T, usize> = HashMap::default();
    let mut ret: Vec<(T, Vec<usize>)> = vec![];
    for (elem, k) in membership.iter().enumerate() {
        let pos = *position.entry(k.clone()).or_insert_with(|| {
            ret.push((k.clone(), vec![]));
            ret.len() - 1
        });
        ret[pos].1.push(elem);
    }
    ret
}

/// Randomly select `ntarget` distinct indexes out of `0..ntot`,
/// returned in increasing order
/// * `ntot` - number of total samples
/// * `ntarget` - number of samples to keep
/// * `seed` - optional seed for reproducibility
pub fn sample_indices(ntot: usize, ntarget: usize, seed: Option<u64>) -> Vec<usize> {
    use rand::SeedableRng;

    let mut idx: Vec<usize> = (0..ntot).collect();
    let mut rng = match seed {
        Some(s) => rand::rngs::StdRng::seed_from_u64(s),
        None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
    };
    idx.shuffle(&mut rng);
    idx.truncate(ntarget.min(ntot));
    idx.sort_unstable();
    idx
}

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let num_batches = ntot.div_ceil(batch_size.max(1));
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Collapse a list of indexes into maximal runs of consecutive
/// values, keeping the given order
///
/// ```text
/// [3, 4, 5, 9, 10, 2] -> [3..6, 9..11, 2..3]
/// ```
pub fn coalesce_runs(indices: &[usize]) -> Vec<Range<usize>> {
    let mut ret: Vec<Range<usize>> = vec![];
    for &i in indices {
        match ret.last_mut() {
            Some(last) if last.end == i => last.end = i + 1,
            _ => ret.push(i..(i + 1)),
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_keeps_first_appearance() {
        let m = vec!["W2", "W1", "W2", "W3", "W1"];
        let parts = partition_by_membership(&m);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], ("W2", vec![0, 2]));
        assert_eq!(parts[1], ("W1", vec![1, 4]));
        assert_eq!(parts[2], ("W3", vec![3]));
    }

    #[test]
    fn runs_are_coalesced() {
        assert_eq!(coalesce_runs(&[3, 4, 5, 9, 10, 2]), vec![3..6, 9..11, 2..3]);
        assert!(coalesce_runs(&[]).is_empty());
    }

    #[test]
    fn minibatch_covers_everything() {
        let jobs = generate_minibatch_intervals(25, 10);
        assert_eq!(jobs, vec![(0, 10), (10, 20), (20, 25)]);
    }

    #[test]
    fn sampled_indices_are_sorted_and_distinct() {
        let idx = sample_indices(100, 10, Some(42));
        assert_eq!(idx.len(), 10);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
    }
}
