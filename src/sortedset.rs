use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::skiplist::SkipList;

pub use crate::skiplist::{Element, ScoreBorder};

/// Member -> score mapping paired with a skip list ordered by
/// (score, member). The map answers point lookups and is authoritative
/// for membership; the list answers rank and range queries. Every member
/// in one structure has exactly one counterpart in the other.
pub struct SortedSet {
    dict: HashMap<String, f64>,
    skiplist: SkipList,
}

impl SortedSet {
    pub fn new() -> SortedSet {
        SortedSet {
            dict: HashMap::new(),
            skiplist: SkipList::new(),
        }
    }

    /// Deterministic skip-list level draws for tests.
    pub fn with_seed(seed: u64) -> SortedSet {
        SortedSet {
            dict: HashMap::new(),
            skiplist: SkipList::with_seed(seed),
        }
    }

    /// Puts a member in the set. Returns true when a new member was
    /// inserted, false when an existing one was updated. A same-score
    /// re-add leaves the list untouched.
    pub fn add(&mut self, member: &str, score: f64) -> bool {
        match self.dict.insert(member.to_string(), score) {
            Some(old) => {
                if old != score {
                    self.skiplist.remove(member, old);
                    self.skiplist.insert(member.to_string(), score);
                }
                false
            }
            None => {
                self.skiplist.insert(member.to_string(), score);
                true
            }
        }
    }

    pub fn get(&self, member: &str) -> Option<Element> {
        self.dict.get(member).map(|&score| Element {
            member: member.to_string(),
            score,
        })
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.dict.remove(member) {
            Some(score) => {
                self.skiplist.remove(member, score);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> i64 {
        self.dict.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// 0-based rank in either direction, -1 when absent.
    pub fn rank(&self, member: &str, desc: bool) -> i64 {
        let Some(&score) = self.dict.get(member) else {
            return -1;
        };
        let raw = self.skiplist.get_rank(member, score);
        if desc {
            self.skiplist.len() - raw
        } else {
            raw - 1
        }
    }

    /// Element at a 1-based ascending rank.
    pub fn get_by_rank(&self, rank: i64) -> Option<Element> {
        self.skiplist
            .get_by_rank(rank)
            .map(|idx| self.skiplist.element(idx).clone())
    }

    /// Visits ranks in the 0-based half-open range [start, stop) in the
    /// requested direction; the visitor returning false stops the walk.
    /// Bounds outside the collection are a caller bug and fail loudly.
    pub fn for_each<F>(&self, start: i64, stop: i64, desc: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(&Element) -> bool,
    {
        let size = self.len();
        if start < 0 || start >= size || stop < start || stop > size {
            return Err(Error::IndexOutOfRange { start, stop, size });
        }

        let mut cursor = if desc {
            if start > 0 {
                self.skiplist.get_by_rank(size - start)
            } else {
                self.skiplist.tail()
            }
        } else if start > 0 {
            self.skiplist.get_by_rank(start + 1)
        } else {
            self.skiplist.first()
        };

        for _ in 0..(stop - start) {
            let Some(idx) = cursor else {
                break;
            };
            if !visit(self.skiplist.element(idx)) {
                break;
            }
            cursor = if desc {
                self.skiplist.prev(idx)
            } else {
                self.skiplist.next(idx)
            };
        }
        Ok(())
    }

    /// Elements at ranks [start, stop), cheap wrapper over `for_each`.
    pub fn range(&self, start: i64, stop: i64, desc: bool) -> Result<Vec<Element>> {
        let mut out = Vec::with_capacity((stop - start).max(0) as usize);
        self.for_each(start, stop, desc, |e| {
            out.push(e.clone());
            true
        })?;
        Ok(out)
    }

    /// Elements whose score falls between the borders, ascending.
    pub fn range_by_score(&self, min: &ScoreBorder, max: &ScoreBorder) -> Vec<Element> {
        let mut out = Vec::new();
        let mut cur = self.skiplist.first_in_score_range(min, max);
        while let Some(idx) = cur {
            let e = self.skiplist.element(idx);
            if !max.greater(e.score) {
                break;
            }
            out.push(e.clone());
            cur = self.skiplist.next(idx);
        }
        out
    }

    pub fn first_in_score_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<Element> {
        self.skiplist
            .first_in_score_range(min, max)
            .map(|idx| self.skiplist.element(idx).clone())
    }

    pub fn last_in_score_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<Element> {
        self.skiplist
            .last_in_score_range(min, max)
            .map(|idx| self.skiplist.element(idx).clone())
    }

    pub fn remove_range_by_score(&mut self, min: &ScoreBorder, max: &ScoreBorder) -> Vec<Element> {
        let removed = self.skiplist.remove_range_by_score(min, max);
        for e in &removed {
            self.dict.remove(&e.member);
        }
        removed
    }

    /// Removes ranks in the 0-based half-open range [start, stop).
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> Vec<Element> {
        let removed = self.skiplist.remove_range_by_rank(start + 1, stop + 1);
        for e in &removed {
            self.dict.remove(&e.member);
        }
        removed
    }
}

impl Default for SortedSet {
    fn default() -> SortedSet {
        SortedSet::new()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn members(set: &SortedSet, desc: bool) -> Vec<String> {
        if set.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        set.for_each(0, set.len(), desc, |e| {
            out.push(e.member.clone());
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn tie_break_is_lexicographic() {
        let mut set = SortedSet::with_seed(1);
        set.add("a", 1.0);
        set.add("b", 2.0);
        set.add("c", 1.0);
        assert_eq!(members(&set, false), vec!["a", "c", "b"]);
    }

    #[test]
    fn same_score_re_add_keeps_cardinality() {
        let mut set = SortedSet::with_seed(1);
        assert!(set.add("x", 5.0));
        assert!(!set.add("x", 5.0));
        assert_eq!(set.len(), 1);
        assert!(!set.add("x", 7.0));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("x").unwrap().score, 7.0);
        assert_eq!(members(&set, false), vec!["x"]);
    }

    #[test]
    fn rank_is_zero_based_both_directions() {
        let mut set = SortedSet::with_seed(3);
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)] {
            set.add(m, s);
        }
        assert_eq!(set.rank("a", false), 0);
        assert_eq!(set.rank("d", false), 3);
        assert_eq!(set.rank("d", true), 0);
        assert_eq!(set.rank("a", true), 3);
        assert_eq!(set.rank("zz", false), -1);

        // GetByRank(Rank(m)+1) round-trips
        for m in ["a", "b", "c", "d"] {
            let e = set.get_by_rank(set.rank(m, false) + 1).unwrap();
            assert_eq!(e.member, m);
        }
    }

    #[test]
    fn for_each_rejects_bad_bounds() {
        let mut set = SortedSet::with_seed(3);
        set.add("a", 1.0);
        set.add("b", 2.0);
        assert!(set.for_each(-1, 1, false, |_| true).is_err());
        assert!(set.for_each(2, 2, false, |_| true).is_err());
        assert!(set.for_each(0, 3, false, |_| true).is_err());
        assert!(set.for_each(1, 0, false, |_| true).is_err());
    }

    #[test]
    fn for_each_halts_on_false() {
        let mut set = SortedSet::with_seed(3);
        for i in 0..10 {
            set.add(&format!("m{}", i), i as f64);
        }
        let mut seen = 0;
        set.for_each(0, 10, false, |_| {
            seen += 1;
            seen < 4
        })
        .unwrap();
        assert_eq!(seen, 4);
    }

    #[test]
    fn large_score_range_query() {
        let mut set = SortedSet::with_seed(9);
        for i in 0..10_000 {
            set.add(&format!("m{:05}", i), i as f64);
        }
        let got = set.range_by_score(
            &ScoreBorder::inclusive(100.0),
            &ScoreBorder::inclusive(200.0),
        );
        assert_eq!(got.len(), 101);
        assert!(got.windows(2).all(|w| w[0].score < w[1].score));
        assert_eq!(got[0].member, "m00100");
        assert_eq!(got[100].member, "m00200");
    }

    #[test]
    fn remove_ranges_update_both_views() {
        let mut set = SortedSet::with_seed(5);
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)] {
            set.add(m, s);
        }
        let gone = set.remove_range_by_rank(1, 3);
        assert_eq!(
            gone.iter().map(|e| e.member.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert_eq!(set.len(), 3);
        assert!(set.get("b").is_none());

        let gone =
            set.remove_range_by_score(&ScoreBorder::NEG_INF, &ScoreBorder::exclusive(5.0));
        assert_eq!(
            gone.iter().map(|e| e.member.as_str()).collect::<Vec<_>>(),
            vec!["a", "d"]
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.rank("e", false), 0);
    }

    proptest! {
        // The set against a model: a map plus explicit (score, member)
        // ordering. Scores come from a small integer pool so updates and
        // ties are frequent.
        #[test]
        fn behaves_like_model(ops in prop::collection::vec(
            (0u8..3, 0u8..24, -5i32..5), 1..120,
        )) {
            let mut set = SortedSet::with_seed(42);
            let mut model: std::collections::HashMap<String, i32> =
                std::collections::HashMap::new();

            for (op, key, score) in ops {
                let member = format!("k{:02}", key);
                match op {
                    0 | 1 => {
                        let inserted = set.add(&member, score as f64);
                        prop_assert_eq!(
                            inserted,
                            model.insert(member, score).is_none()
                        );
                    }
                    _ => {
                        let removed = set.remove(&member);
                        prop_assert_eq!(removed, model.remove(&member).is_some());
                    }
                }

                prop_assert_eq!(set.len(), model.len() as i64);

                let mut expected: Vec<(i32, String)> =
                    model.iter().map(|(m, &s)| (s, m.clone())).collect();
                expected.sort();

                let mut got = Vec::new();
                if !set.is_empty() {
                    set.for_each(0, set.len(), false, |e| {
                        got.push((e.score as i32, e.member.clone()));
                        true
                    }).unwrap();
                }
                prop_assert_eq!(&got, &expected);

                // ranks agree with iteration order in both directions
                for (i, (_, m)) in expected.iter().enumerate() {
                    prop_assert_eq!(set.rank(m, false), i as i64);
                    prop_assert_eq!(
                        set.rank(m, true),
                        (expected.len() - 1 - i) as i64
                    );
                }
            }
        }
    }
}
