//! Postings merge and chunking.
//!
//! Candidates are the patients that took *any* of the queried medicines and
//! reported *any* of the queried side effects: the intersection of two
//! unions of sorted postings lists.

use crate::domain::PatientId;

/// Union of sorted postings lists, deduplicated.
///
/// Lists are combined by recursive halving, so the work stays
/// `O(n log k)` for `k` lists. On equal heads the left entry is skipped and
/// the right one kept.
#[must_use]
pub fn merge_or(lists: &[&[PatientId]]) -> Vec<PatientId> {
    match lists {
        [] => Vec::new(),
        [single] => single.to_vec(),
        _ => {
            let (left, right) = lists.split_at(lists.len() / 2);
            union(&merge_or(left), &merge_or(right))
        }
    }
}

fn union(left: &[PatientId], right: &[PatientId]) -> Vec<PatientId> {
    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut l, mut r) = (0, 0);
    while l < left.len() && r < right.len() {
        if left[l] < right[r] {
            out.push(left[l]);
            l += 1;
        } else {
            if left[l] == right[r] {
                l += 1;
            }
            out.push(right[r]);
            r += 1;
        }
    }
    out.extend_from_slice(&left[l..]);
    out.extend_from_slice(&right[r..]);
    out
}

/// Intersection of two sorted lists.
#[must_use]
pub fn merge_and(left: &[PatientId], right: &[PatientId]) -> Vec<PatientId> {
    let mut out = Vec::new();
    let (mut l, mut r) = (0, 0);
    while l < left.len() && r < right.len() {
        match left[l].cmp(&right[r]) {
            std::cmp::Ordering::Less => l += 1,
            std::cmp::Ordering::Greater => r += 1,
            std::cmp::Ordering::Equal => {
                out.push(left[l]);
                l += 1;
                r += 1;
            }
        }
    }
    out
}

/// Candidates for a query: `AND(OR(medicines), OR(side_effects))`.
#[must_use]
pub fn filter_candidates(
    medicine_lists: &[&[PatientId]],
    side_effect_lists: &[&[PatientId]],
) -> Vec<PatientId> {
    merge_and(&merge_or(medicine_lists), &merge_or(side_effect_lists))
}

/// Split `candidates` into consecutive chunks of `size`; the last may be shorter.
///
/// # Panics
/// Panics if `size` is zero. Configuration validation rules this out.
#[must_use]
pub fn chunk(candidates: &[PatientId], size: usize) -> Vec<Vec<PatientId>> {
    candidates.chunks(size).map(<[PatientId]>::to_vec).collect()
}
