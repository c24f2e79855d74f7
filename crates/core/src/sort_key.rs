/// Fractional ordering key. Keys are integer tuples compared
/// lexicographically, a strict prefix sorting before any extension of it.
/// A key strictly between two neighbors can always be built in O(1)
/// amortized, so a node can be relocated anywhere in a large graph without
/// renumbering its neighbors.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey(Vec<i64>);

impl SortKey {
    /// The list sentinel's key. Compares below every other key, but the
    /// sentinel never takes part in ordering queries; its key only serves
    /// as the boundary operand for `between`.
    pub fn origin() -> Self {
        SortKey(vec![])
    }

    /// Builds a key strictly between `prev` and `next`, assuming
    /// `prev < next` unless one of them is the boundary key.
    pub fn between(prev: &SortKey, next: &SortKey) -> SortKey {
        let p = &prev.0;
        let n = &next.0;
        if p.len() > n.len() {
            let mut k = p[..n.len() + 1].to_vec();
            *k.last_mut().unwrap() += 1;
            SortKey(k)
        } else if p.len() < n.len() {
            let mut k = n[..p.len() + 1].to_vec();
            *k.last_mut().unwrap() -= 1;
            SortKey(k)
        } else {
            let mut k = p.clone();
            k.push(0);
            SortKey(k)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn between_is_strictly_between() {
        let a = SortKey(vec![0]);
        let b = SortKey(vec![1]);
        let m = SortKey::between(&a, &b);
        assert!(a < m && m < b);

        let m2 = SortKey::between(&a, &m);
        assert!(a < m2 && m2 < m);

        let m3 = SortKey::between(&m2, &m);
        assert!(m2 < m3 && m3 < m);
    }

    #[test]
    fn boundary_appends_monotonically() {
        let origin = SortKey::origin();
        let mut last = SortKey::between(&origin, &origin);
        for _ in 0..100 {
            let next = SortKey::between(&last, &origin);
            assert!(last < next);
            last = next;
        }
    }

    #[test]
    fn boundary_prepends_monotonically() {
        let origin = SortKey::origin();
        let mut first = SortKey::between(&origin, &origin);
        for _ in 0..100 {
            let prev = SortKey::between(&origin, &first);
            assert!(prev < first);
            first = prev;
        }
    }

    #[test]
    fn dense_insertion_stays_ordered() {
        // Repeatedly split the same gap; every new key must land strictly
        // between its neighbors without disturbing the rest.
        let mut keys = vec![SortKey(vec![0]), SortKey(vec![1])];
        for _ in 0..64 {
            let mid = SortKey::between(&keys[0], &keys[1]);
            keys.insert(1, mid);
        }
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }
    }
}
