//! Greedy minimisation of failing test cases.

use crate::error::ShrinkStep;

/// Result of minimising a failing value.
#[derive(Debug, Clone)]
pub struct Minimised<T, E> {
    /// Smallest value still known to fail.
    pub value: T,
    /// How that value failed on its last execution.
    pub failure: E,
    /// Number of accepted shrinks.
    pub shrinks: usize,
    pub steps: Vec<ShrinkStep>,
}

/// Repeatedly replace `original` by its first candidate that still fails.
///
/// `reproduce` re-runs a candidate and returns its failure, or `None` if it
/// passed. Stops when no candidate fails or after `limit` accepted shrinks;
/// the last known failing value is returned either way.
pub fn minimise<T, E, C, R, D>(
    original: T,
    failure: E,
    limit: usize,
    candidates: C,
    mut reproduce: R,
    describe: D,
) -> Minimised<T, E>
where
    C: Fn(&T) -> Vec<T>,
    R: FnMut(&T) -> Option<E>,
    D: Fn(&T) -> String,
{
    let mut current = original;
    let mut failure = failure;
    let mut steps = vec![ShrinkStep {
        counterexample: describe(&current),
        step: 0,
    }];
    let mut shrinks = 0;

    'search: while shrinks < limit {
        for candidate in candidates(&current) {
            if let Some(candidate_failure) = reproduce(&candidate) {
                current = candidate;
                failure = candidate_failure;
                shrinks += 1;
                steps.push(ShrinkStep {
                    counterexample: describe(&current),
                    step: shrinks,
                });
                continue 'search;
            }
        }
        break;
    }

    Minimised {
        value: current,
        failure,
        shrinks,
        steps,
    }
}

/// Copies of `xs` with one contiguous chunk removed: the whole list first,
/// then halves, quarters, down to single elements.
pub fn removals<T: Clone>(xs: &[T]) -> Vec<Vec<T>> {
    let n = xs.len();
    let mut out = Vec::new();
    let mut chunk = n;
    while chunk > 0 {
        let mut start = 0;
        while start < n {
            let end = (start + chunk).min(n);
            let mut candidate = Vec::with_capacity(n - (end - start));
            candidate.extend_from_slice(&xs[..start]);
            candidate.extend_from_slice(&xs[end..]);
            out.push(candidate);
            start += chunk;
        }
        chunk /= 2;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removals_order() {
        let xs = [1, 2, 3, 4];
        let candidates = removals(&xs);
        assert_eq!(candidates[0], Vec::<i32>::new());
        assert_eq!(candidates[1], vec![3, 4]);
        assert_eq!(candidates[2], vec![1, 2]);
        assert!(candidates.contains(&vec![1, 3, 4]));
        assert_eq!(candidates.len(), 1 + 2 + 4);
    }

    #[test]
    fn test_removals_of_empty_list() {
        assert!(removals::<u8>(&[]).is_empty());
    }

    #[test]
    fn test_minimise_finds_smallest_failing_list() {
        // Fails whenever the list still contains a 7.
        let result = minimise(
            vec![1, 7, 3, 9, 7, 2],
            (),
            100,
            |xs: &Vec<i32>| removals(xs),
            |xs| xs.contains(&7).then_some(()),
            |xs| format!("{xs:?}"),
        );

        assert_eq!(result.value, vec![7]);
        assert_eq!(result.steps.first().map(|s| s.step), Some(0));
        assert_eq!(result.steps.len(), result.shrinks + 1);
    }

    #[test]
    fn test_minimise_is_idempotent() {
        let fails = |xs: &Vec<i32>| (xs.iter().sum::<i32>() >= 10).then_some(());
        let first = minimise(
            vec![4, 3, 8, 1],
            (),
            100,
            |xs: &Vec<i32>| removals(xs),
            fails,
            |xs| format!("{xs:?}"),
        );
        let second = minimise(
            first.value.clone(),
            (),
            100,
            |xs: &Vec<i32>| removals(xs),
            fails,
            |xs| format!("{xs:?}"),
        );

        assert_eq!(first.value, second.value);
        assert_eq!(second.shrinks, 0);
    }

    #[test]
    fn test_minimise_respects_limit() {
        let result = minimise(
            vec![1, 2, 3, 4, 5, 6, 7, 8],
            (),
            1,
            |xs: &Vec<i32>| removals(xs),
            |xs| (!xs.is_empty()).then_some(()),
            |xs| format!("{xs:?}"),
        );
        assert_eq!(result.shrinks, 1);
        assert_eq!(result.value.len(), 4);
    }
}
