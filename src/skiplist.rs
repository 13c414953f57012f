use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const MAX_LEVEL: usize = 32;
const P: f64 = 0.25;

/// Slot of the header node in the arena. The header carries no element
/// and permanently owns MAX_LEVEL lanes.
const HEADER: usize = 0;

/// A member/score pair, the unit the sorted set hands out.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub member: String,
    pub score: f64,
}

/// A range endpoint over scores: a finite value with an exclusion flag,
/// or one of the two infinities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBorder {
    inf: i8,
    pub value: f64,
    pub exclude: bool,
}

impl ScoreBorder {
    pub const NEG_INF: ScoreBorder = ScoreBorder {
        inf: -1,
        value: 0.0,
        exclude: false,
    };
    pub const POS_INF: ScoreBorder = ScoreBorder {
        inf: 1,
        value: 0.0,
        exclude: false,
    };

    pub fn inclusive(value: f64) -> ScoreBorder {
        ScoreBorder {
            inf: 0,
            value,
            exclude: false,
        }
    }

    pub fn exclusive(value: f64) -> ScoreBorder {
        ScoreBorder {
            inf: 0,
            value,
            exclude: true,
        }
    }

    /// True when a value sits strictly after this border reading it as a
    /// minimum: `-inf` admits everything, `(5` admits 5.1 but not 5.
    pub fn less(&self, value: f64) -> bool {
        match self.inf {
            i8::MIN..=-1 => true,
            0 => {
                if self.exclude {
                    self.value < value
                } else {
                    self.value <= value
                }
            }
            _ => false,
        }
    }

    /// Mirror of `less` for a maximum border.
    pub fn greater(&self, value: f64) -> bool {
        match self.inf {
            i8::MIN..=-1 => false,
            0 => {
                if self.exclude {
                    self.value > value
                } else {
                    self.value >= value
                }
            }
            _ => true,
        }
    }

    /// Parses a RESP range argument: `5`, `(5`, `-inf`, `+inf`, `inf`.
    pub fn parse(raw: &[u8]) -> Option<ScoreBorder> {
        match raw {
            b"-inf" => return Some(ScoreBorder::NEG_INF),
            b"+inf" | b"inf" => return Some(ScoreBorder::POS_INF),
            _ => {}
        }
        let (digits, exclude) = match raw.first() {
            Some(b'(') => (&raw[1..], true),
            _ => (raw, false),
        };
        let value: f64 = std::str::from_utf8(digits).ok()?.parse().ok()?;
        Some(ScoreBorder {
            inf: 0,
            value,
            exclude,
        })
    }
}

struct Level {
    forward: Option<usize>,
    /// Base-level steps covered by `forward`. Meaningful only while
    /// `forward` is set.
    span: i64,
}

struct Node {
    element: Element,
    backward: Option<usize>,
    levels: Vec<Level>,
}

impl Node {
    fn new(element: Element, level: usize) -> Node {
        Node {
            element,
            backward: None,
            levels: (0..level)
                .map(|_| Level {
                    forward: None,
                    span: 0,
                })
                .collect(),
        }
    }
}

/// Skip list ordered by (score ascending, member lex-ascending). Nodes
/// live in an arena and link to each other by slot index, so the
/// backward pointer and the level lanes can form the usual cyclic graph
/// without shared ownership.
pub struct SkipList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    tail: Option<usize>,
    length: i64,
    level: usize,
    rng: StdRng,
}

impl SkipList {
    pub fn new() -> SkipList {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic level draws for tests.
    pub fn with_seed(seed: u64) -> SkipList {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> SkipList {
        let header = Node::new(
            Element {
                member: String::new(),
                score: 0.0,
            },
            MAX_LEVEL,
        );
        SkipList {
            nodes: vec![Some(header)],
            free: Vec::new(),
            tail: None,
            length: 0,
            level: 1,
            rng,
        }
    }

    pub fn len(&self) -> i64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[cfg(test)]
    pub(crate) fn current_level(&self) -> usize {
        self.level
    }

    pub fn first(&self) -> Option<usize> {
        self.node(HEADER).levels[0].forward
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn next(&self, idx: usize) -> Option<usize> {
        self.node(idx).levels[0].forward
    }

    pub fn prev(&self, idx: usize) -> Option<usize> {
        self.node(idx).backward
    }

    pub fn element(&self, idx: usize) -> &Element {
        &self.node(idx).element
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("dangling skiplist handle")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("dangling skiplist handle")
    }

    fn alloc(&mut self, element: Element, level: usize) -> usize {
        let node = Node::new(element, level);
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    /// Pr[L >= k+1] = P * Pr[L >= k], capped at MAX_LEVEL.
    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen_bool(P) {
            level += 1;
        }
        level
    }

    /// Does `forward` of `x` at `i` sort strictly before (score, member)?
    fn forward_precedes(&self, x: usize, i: usize, score: f64, member: &str) -> Option<usize> {
        let next = self.node(x).levels[i].forward?;
        let e = &self.node(next).element;
        let precedes =
            e.score < score || (e.score == score && e.member.as_str() < member);
        precedes.then_some(next)
    }

    /// Inserts a fresh (member, score). The caller guarantees the member
    /// is not present; duplicates are the sorted set's job to rule out.
    pub fn insert(&mut self, member: String, score: f64) {
        let mut update = [HEADER; MAX_LEVEL];
        let mut rank = [0i64; MAX_LEVEL];

        let mut x = HEADER;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.forward_precedes(x, i, score, &member) {
                rank[i] += self.node(x).levels[i].span;
                x = next;
            }
            update[i] = x;
        }

        let level = self.random_level();
        if level > self.level {
            for i in self.level..level {
                rank[i] = 0;
                update[i] = HEADER;
                self.node_mut(HEADER).levels[i].span = self.length;
            }
            self.level = level;
        }

        let idx = self.alloc(Element { member, score }, level);
        for i in 0..level {
            let upd = update[i];
            let upd_forward = self.node(upd).levels[i].forward;
            let upd_span = self.node(upd).levels[i].span;
            {
                let n = self.node_mut(idx);
                n.levels[i].forward = upd_forward;
                n.levels[i].span = upd_span - (rank[0] - rank[i]);
            }
            let u = self.node_mut(upd);
            u.levels[i].forward = Some(idx);
            u.levels[i].span = (rank[0] - rank[i]) + 1;
        }
        for i in level..self.level {
            self.node_mut(update[i]).levels[i].span += 1;
        }

        self.node_mut(idx).backward = (update[0] != HEADER).then_some(update[0]);
        match self.node(idx).levels[0].forward {
            Some(fwd) => self.node_mut(fwd).backward = Some(idx),
            None => self.tail = Some(idx),
        }
        self.length += 1;
    }

    pub fn remove(&mut self, member: &str, score: f64) -> bool {
        let mut update = [HEADER; MAX_LEVEL];
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.forward_precedes(x, i, score, member) {
                x = next;
            }
            update[i] = x;
        }
        if let Some(target) = self.node(x).levels[0].forward {
            let e = &self.node(target).element;
            if e.score == score && e.member == member {
                self.remove_node(target, &update);
                return true;
            }
        }
        false
    }

    /// Unlinks `x` given its predecessors at every live level, fixing
    /// spans, backward pointers, tail and the list level.
    fn remove_node(&mut self, x: usize, update: &[usize; MAX_LEVEL]) {
        for i in 0..self.level {
            let u = update[i];
            if self.node(u).levels[i].forward == Some(x) {
                let x_span = self.node(x).levels[i].span;
                let x_forward = self.node(x).levels[i].forward;
                let un = self.node_mut(u);
                un.levels[i].span += x_span - 1;
                un.levels[i].forward = x_forward;
            } else {
                self.node_mut(u).levels[i].span -= 1;
            }
        }

        let x_forward = self.node(x).levels[0].forward;
        let x_backward = self.node(x).backward;
        match x_forward {
            Some(fwd) => self.node_mut(fwd).backward = x_backward,
            None => self.tail = x_backward,
        }
        while self.level > 1 && self.node(HEADER).levels[self.level - 1].forward.is_none() {
            self.level -= 1;
        }
        self.length -= 1;
        self.release(x);
    }

    /// 1-based rank of (member, score); 0 means absent. The walk advances
    /// through members `<=` the target so equal keys are entered, not
    /// stopped at.
    pub fn get_rank(&self, member: &str, score: f64) -> i64 {
        let mut rank = 0i64;
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                let e = &self.node(next).element;
                if e.score < score || (e.score == score && e.member.as_str() <= member) {
                    rank += self.node(x).levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            if x != HEADER && self.node(x).element.member == member {
                return rank;
            }
        }
        0
    }

    /// Node at a 1-based rank.
    pub fn get_by_rank(&self, rank: i64) -> Option<usize> {
        if rank <= 0 || rank > self.length {
            return None;
        }
        let mut traversed = 0i64;
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                if traversed + self.node(x).levels[i].span <= rank {
                    traversed += self.node(x).levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            if traversed == rank {
                return Some(x);
            }
        }
        None
    }

    pub fn has_in_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> bool {
        // empty border pair
        if min.inf == 0 && max.inf == 0 {
            if min.value > max.value
                || (min.value == max.value && (min.exclude || max.exclude))
            {
                return false;
            }
        }
        if min.inf > 0 || max.inf < 0 {
            return false;
        }
        let Some(tail) = self.tail else {
            return false;
        };
        if !min.less(self.node(tail).element.score) {
            return false;
        }
        let Some(head) = self.node(HEADER).levels[0].forward else {
            return false;
        };
        max.greater(self.node(head).element.score)
    }

    pub fn first_in_score_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                if !min.less(self.node(next).element.score) {
                    x = next;
                } else {
                    break;
                }
            }
        }
        // inner range, so the next node exists
        let first = self.node(x).levels[0].forward?;
        max.greater(self.node(first).element.score).then_some(first)
    }

    pub fn last_in_score_range(&self, min: &ScoreBorder, max: &ScoreBorder) -> Option<usize> {
        if !self.has_in_range(min, max) {
            return None;
        }
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                if max.greater(self.node(next).element.score) {
                    x = next;
                } else {
                    break;
                }
            }
        }
        (x != HEADER && min.less(self.node(x).element.score)).then_some(x)
    }

    /// Removes every element whose score falls between the borders,
    /// returning them in ascending order.
    pub fn remove_range_by_score(&mut self, min: &ScoreBorder, max: &ScoreBorder) -> Vec<Element> {
        let mut update = [HEADER; MAX_LEVEL];
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                if !min.less(self.node(next).element.score) {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let mut removed = Vec::new();
        let mut cur = self.node(x).levels[0].forward;
        while let Some(idx) = cur {
            if !max.greater(self.node(idx).element.score) {
                break;
            }
            let next = self.node(idx).levels[0].forward;
            removed.push(self.node(idx).element.clone());
            self.remove_node(idx, &update);
            cur = next;
        }
        removed
    }

    /// Removes ranks in the 1-based half-open range [start, stop).
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> Vec<Element> {
        let mut traversed = 0i64;
        let mut update = [HEADER; MAX_LEVEL];
        let mut x = HEADER;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                if traversed + self.node(x).levels[i].span < start {
                    traversed += self.node(x).levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        traversed += 1;
        let mut removed = Vec::new();
        let mut cur = self.node(x).levels[0].forward;
        while let Some(idx) = cur {
            if traversed >= stop {
                break;
            }
            let next = self.node(idx).levels[0].forward;
            removed.push(self.node(idx).element.clone());
            self.remove_node(idx, &update);
            cur = next;
            traversed += 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(pairs: &[(&str, f64)]) -> SkipList {
        let mut list = SkipList::with_seed(7);
        for (m, s) in pairs {
            list.insert(m.to_string(), *s);
        }
        list
    }

    fn members_in_order(list: &SkipList) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        let mut cur = list.first();
        while let Some(idx) = cur {
            let e = list.element(idx);
            out.push((e.member.clone(), e.score));
            cur = list.next(idx);
        }
        out
    }

    #[test]
    fn base_level_stays_sorted() {
        let list = filled(&[("d", 4.0), ("a", 1.0), ("c", 2.0), ("b", 2.0), ("e", 0.5)]);
        let got = members_in_order(&list);
        let members: Vec<&str> = got.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["e", "a", "b", "c", "d"]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn equal_scores_break_ties_by_member() {
        let list = filled(&[("b", 1.0), ("a", 1.0), ("c", 1.0)]);
        let members: Vec<String> = members_in_order(&list).into_iter().map(|(m, _)| m).collect();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[test]
    fn rank_and_get_by_rank_agree() {
        let pairs: Vec<(String, f64)> =
            (0..200).map(|i| (format!("m{:03}", i), (i % 37) as f64)).collect();
        let mut list = SkipList::with_seed(11);
        for (m, s) in &pairs {
            list.insert(m.clone(), *s);
        }
        let ordered = members_in_order(&list);
        for (i, (member, score)) in ordered.iter().enumerate() {
            let rank = list.get_rank(member, *score);
            assert_eq!(rank, i as i64 + 1, "member {}", member);
            let idx = list.get_by_rank(rank).unwrap();
            assert_eq!(&list.element(idx).member, member);
        }
        assert_eq!(list.get_rank("missing", 1.0), 0);
        assert!(list.get_by_rank(0).is_none());
        assert!(list.get_by_rank(list.len() + 1).is_none());
    }

    #[test]
    fn remove_relinks_and_demotes() {
        let mut list = filled(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]);
        assert!(list.remove("b", 2.0));
        assert!(!list.remove("b", 2.0));
        assert!(!list.remove("a", 9.0)); // wrong score
        let members: Vec<String> = members_in_order(&list).into_iter().map(|(m, _)| m).collect();
        assert_eq!(members, vec!["a", "c"]);
        assert_eq!(list.len(), 2);

        assert!(list.remove("a", 1.0));
        assert!(list.remove("c", 3.0));
        assert_eq!(list.len(), 0);
        assert_eq!(list.current_level(), 1);
        assert!(list.first().is_none());
        assert!(list.tail().is_none());
    }

    #[test]
    fn backward_chain_mirrors_forward() {
        let list = filled(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let mut cur = list.tail();
        let mut rev = Vec::new();
        while let Some(idx) = cur {
            rev.push(list.element(idx).member.clone());
            cur = list.prev(idx);
        }
        assert_eq!(rev, vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn score_range_endpoints() {
        let list = filled(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)]);
        let first = list
            .first_in_score_range(&ScoreBorder::inclusive(2.0), &ScoreBorder::POS_INF)
            .unwrap();
        assert_eq!(list.element(first).member, "b");
        let first = list
            .first_in_score_range(&ScoreBorder::exclusive(2.0), &ScoreBorder::POS_INF)
            .unwrap();
        assert_eq!(list.element(first).member, "c");
        let last = list
            .last_in_score_range(&ScoreBorder::NEG_INF, &ScoreBorder::exclusive(3.0))
            .unwrap();
        assert_eq!(list.element(last).member, "b");
        assert!(list
            .first_in_score_range(&ScoreBorder::inclusive(9.0), &ScoreBorder::POS_INF)
            .is_none());
        assert!(list
            .first_in_score_range(&ScoreBorder::exclusive(2.0), &ScoreBorder::exclusive(2.0))
            .is_none());
    }

    #[test]
    fn remove_range_by_score_returns_ascending() {
        let mut list = filled(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)]);
        let removed =
            list.remove_range_by_score(&ScoreBorder::inclusive(2.0), &ScoreBorder::inclusive(4.0));
        let members: Vec<String> = removed.into_iter().map(|e| e.member).collect();
        assert_eq!(members, vec!["b", "c", "d"]);
        assert_eq!(list.len(), 2);
        let left: Vec<String> = members_in_order(&list).into_iter().map(|(m, _)| m).collect();
        assert_eq!(left, vec!["a", "e"]);
    }

    #[test]
    fn remove_range_by_rank_is_half_open() {
        let mut list = filled(&[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)]);
        let removed = list.remove_range_by_rank(2, 4);
        let members: Vec<String> = removed.into_iter().map(|e| e.member).collect();
        assert_eq!(members, vec!["b", "c"]);
        let left: Vec<String> = members_in_order(&list).into_iter().map(|(m, _)| m).collect();
        assert_eq!(left, vec!["a", "d", "e"]);
    }

    #[test]
    fn border_parse_and_comparisons() {
        assert_eq!(ScoreBorder::parse(b"-inf"), Some(ScoreBorder::NEG_INF));
        assert_eq!(ScoreBorder::parse(b"+inf"), Some(ScoreBorder::POS_INF));
        assert_eq!(ScoreBorder::parse(b"3.5"), Some(ScoreBorder::inclusive(3.5)));
        assert_eq!(ScoreBorder::parse(b"(3.5"), Some(ScoreBorder::exclusive(3.5)));
        assert_eq!(ScoreBorder::parse(b"nope"), None);

        assert!(ScoreBorder::NEG_INF.less(f64::MIN));
        assert!(!ScoreBorder::POS_INF.less(f64::MAX));
        assert!(ScoreBorder::inclusive(5.0).less(5.0));
        assert!(!ScoreBorder::exclusive(5.0).less(5.0));
        assert!(ScoreBorder::POS_INF.greater(f64::MAX));
        assert!(ScoreBorder::inclusive(5.0).greater(5.0));
        assert!(!ScoreBorder::exclusive(5.0).greater(5.0));
    }
}
