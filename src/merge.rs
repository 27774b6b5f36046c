use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

/// Merges two ordered record collections into one, deduplicating by the key
/// `key_of` extracts.
///
/// All of `a` is folded in first, then all of `b`; a colliding key from `b`
/// replaces the record from `a` unless `combine` is supplied, in which case
/// the two are folded via `combine(existing, incoming)`. Insertion order is
/// preserved unless `compare` re-sorts the result.
///
/// When either input is empty the other is returned by move, without a new
/// allocation; callers rely on this to skip redundant downstream
/// recomputation for unchanged data.
pub fn merge<T, K, F>(
    a: Vec<T>,
    b: Vec<T>,
    key_of: F,
    combine: Option<&dyn Fn(T, T) -> T>,
    compare: Option<&dyn Fn(&T, &T) -> Ordering>,
) -> Vec<T>
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }

    let mut slots: Vec<Option<T>> = Vec::with_capacity(a.len() + b.len());
    let mut positions: HashMap<K, usize> = HashMap::with_capacity(a.len() + b.len());

    for item in a.into_iter().chain(b) {
        match positions.entry(key_of(&item)) {
            Entry::Occupied(entry) => {
                let pos = *entry.get();
                let merged = match (slots[pos].take(), combine) {
                    (Some(existing), Some(combine)) => combine(existing, item),
                    _ => item,
                };
                slots[pos] = Some(merged);
            }
            Entry::Vacant(entry) => {
                entry.insert(slots.len());
                slots.push(Some(item));
            }
        }
    }

    let mut merged: Vec<T> = slots.into_iter().flatten().collect();
    if let Some(compare) = compare {
        merged.sort_by(|x, y| compare(x, y));
    }
    merged
}

/// [`merge`] with colliding records from `b` replacing those from `a`.
pub fn merge_replace<T, K, F>(a: Vec<T>, b: Vec<T>, key_of: F) -> Vec<T>
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    merge(a, b, key_of, None, None)
}

/// [`merge`] with colliding records folded via `combine`.
pub fn merge_combined<T, K, F>(
    a: Vec<T>,
    b: Vec<T>,
    key_of: F,
    combine: &dyn Fn(T, T) -> T,
) -> Vec<T>
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    merge(a, b, key_of, Some(combine), None)
}
