//! Subset search shared by the blocking and preemptive policies.

/// Candidate sets up to this size are searched exhaustively.
pub const EXHAUSTIVE_LIMIT: usize = 12;

/// Find the best subset of `0..n` satisfying `feasible`, ranked by `rank`
/// (smaller is better; the first subset found wins ties).
///
/// With more than [`EXHAUSTIVE_LIMIT`] items, indices are added in
/// `greedy_order` until the set is feasible, then redundant members are
/// dropped from the back.
pub fn best_subset<K: PartialOrd>(
    n: usize,
    greedy_order: &[usize],
    feasible: impl Fn(&[usize]) -> bool,
    rank: impl Fn(&[usize]) -> K,
) -> Option<Vec<usize>> {
    if n <= EXHAUSTIVE_LIMIT {
        let mut best: Option<(K, Vec<usize>)> = None;
        for mask in 0u32..(1u32 << n) {
            let subset: Vec<usize> = (0..n).filter(|i| mask & (1 << i) != 0).collect();
            if !feasible(&subset) {
                continue;
            }
            let key = rank(&subset);
            if best.as_ref().is_none_or(|(b, _)| key < *b) {
                best = Some((key, subset));
            }
        }
        return best.map(|(_, s)| s);
    }

    let mut chosen = Vec::new();
    for &i in greedy_order {
        if feasible(&chosen) {
            break;
        }
        chosen.push(i);
    }
    if !feasible(&chosen) {
        return None;
    }
    let mut idx = chosen.len();
    while idx > 0 {
        idx -= 1;
        let mut without = chosen.clone();
        without.remove(idx);
        if feasible(&without) {
            chosen = without;
        }
    }
    Some(chosen)
}
