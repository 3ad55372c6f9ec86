//! Sorted set: a skiplist ordered by (score, member) plus a hash index
//! for O(1) member→score lookups.
//!
//! The skiplist is the classic probabilistic structure (max level 16,
//! geometric level distribution with p = 1/4). Every level link keeps a
//! `span` — the number of level-0 steps it covers — so rank queries and
//! rank-range walks run in O(log n). Nodes live in an arena indexed by
//! u32 with a free list, which keeps the structure in safe code.

use ahash::AHashMap;
use ordered_float::OrderedFloat;
use rand::Rng;

const MAX_LEVEL: usize = 16;
const LEVEL_P: f64 = 0.25;

/// One end of a score range. Parsed from the wire forms `3.5`, `(3.5`,
/// `-inf`, `+inf`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    NegInf,
    PosInf,
    Value { score: f64, exclusive: bool },
}

impl ScoreBound {
    /// Parses a bound from its wire representation.
    pub fn parse(raw: &[u8]) -> Option<ScoreBound> {
        let s = std::str::from_utf8(raw).ok()?;
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "-inf" | "-infinity" => return Some(ScoreBound::NegInf),
            "+inf" | "inf" | "+infinity" | "infinity" => return Some(ScoreBound::PosInf),
            _ => {}
        }
        if let Some(rest) = lower.strip_prefix('(') {
            let score: f64 = rest.parse().ok()?;
            return Some(ScoreBound::Value {
                score,
                exclusive: true,
            });
        }
        let score: f64 = lower.parse().ok()?;
        Some(ScoreBound::Value {
            score,
            exclusive: false,
        })
    }

    /// `true` when `score` satisfies this bound used as a range minimum.
    pub fn admits_as_min(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInf => true,
            ScoreBound::PosInf => false,
            ScoreBound::Value {
                score: v,
                exclusive,
            } => {
                if exclusive {
                    score > v
                } else {
                    score >= v
                }
            }
        }
    }

    /// `true` when `score` satisfies this bound used as a range maximum.
    pub fn admits_as_max(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInf => false,
            ScoreBound::PosInf => true,
            ScoreBound::Value {
                score: v,
                exclusive,
            } => {
                if exclusive {
                    score < v
                } else {
                    score <= v
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Link {
    forward: Option<u32>,
    span: u32,
}

#[derive(Debug)]
struct Node {
    member: String,
    score: f64,
    links: Vec<Link>,
    backward: Option<u32>,
}

/// Skiplist keyed by (score, member).
struct SkipList {
    arena: Vec<Node>,
    free: Vec<u32>,
    head: Vec<Link>,
    tail: Option<u32>,
    level: usize,
    len: usize,
}

impl SkipList {
    fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            head: vec![
                Link {
                    forward: None,
                    span: 0,
                };
                MAX_LEVEL
            ],
            tail: None,
            level: 1,
            len: 0,
        }
    }

    fn node(&self, id: u32) -> &Node {
        &self.arena[id as usize]
    }

    fn link(&self, from: Option<u32>, lvl: usize) -> Link {
        match from {
            None => self.head[lvl],
            Some(id) => self.node(id).links[lvl],
        }
    }

    fn link_mut(&mut self, from: Option<u32>, lvl: usize) -> &mut Link {
        match from {
            None => &mut self.head[lvl],
            Some(id) => &mut self.arena[id as usize].links[lvl],
        }
    }

    fn key_less(a_score: f64, a_member: &str, b_score: f64, b_member: &str) -> bool {
        (OrderedFloat(a_score), a_member) < (OrderedFloat(b_score), b_member)
    }

    fn random_level() -> usize {
        let mut rng = rand::rng();
        let mut level = 1;
        while level < MAX_LEVEL && rng.random::<f64>() < LEVEL_P {
            level += 1;
        }
        level
    }

    fn alloc(&mut self, node: Node) -> u32 {
        if let Some(id) = self.free.pop() {
            self.arena[id as usize] = node;
            id
        } else {
            self.arena.push(node);
            (self.arena.len() - 1) as u32
        }
    }

    /// Inserts a (member, score) pair. The caller guarantees the member
    /// is not already present.
    fn insert(&mut self, member: String, score: f64) {
        let mut update: [Option<u32>; MAX_LEVEL] = [None; MAX_LEVEL];
        let mut rank = [0u32; MAX_LEVEL];

        let mut x: Option<u32> = None;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            loop {
                let link = self.link(x, i);
                match link.forward {
                    Some(next)
                        if Self::key_less(
                            self.node(next).score,
                            &self.node(next).member,
                            score,
                            &member,
                        ) =>
                    {
                        rank[i] += link.span;
                        x = Some(next);
                    }
                    _ => break,
                }
            }
            update[i] = x;
        }

        let new_level = Self::random_level();
        if new_level > self.level {
            for i in self.level..new_level {
                rank[i] = 0;
                update[i] = None;
                self.head[i].span = self.len as u32;
            }
            self.level = new_level;
        }

        let links = vec![
            Link {
                forward: None,
                span: 0,
            };
            new_level
        ];
        let id = self.alloc(Node {
            member,
            score,
            links,
            backward: update[0],
        });

        for i in 0..new_level {
            let prev_link = self.link(update[i], i);
            let node_span = prev_link.span - (rank[0] - rank[i]);
            let node_forward = prev_link.forward;
            {
                let l = &mut self.arena[id as usize].links[i];
                l.forward = node_forward;
                l.span = node_span;
            }
            let l = self.link_mut(update[i], i);
            l.forward = Some(id);
            l.span = (rank[0] - rank[i]) + 1;
        }
        for i in new_level..self.level {
            self.link_mut(update[i], i).span += 1;
        }

        match self.node(id).links[0].forward {
            Some(next) => self.arena[next as usize].backward = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    /// Removes the exact (member, score) pair. The caller guarantees it
    /// exists with this score.
    fn remove(&mut self, member: &str, score: f64) {
        let mut update: [Option<u32>; MAX_LEVEL] = [None; MAX_LEVEL];

        let mut x: Option<u32> = None;
        for i in (0..self.level).rev() {
            loop {
                let link = self.link(x, i);
                match link.forward {
                    Some(next)
                        if Self::key_less(
                            self.node(next).score,
                            &self.node(next).member,
                            score,
                            member,
                        ) =>
                    {
                        x = Some(next);
                    }
                    _ => break,
                }
            }
            update[i] = x;
        }

        let target = match self.link(x, 0).forward {
            Some(id)
                if self.node(id).member == member
                    && OrderedFloat(self.node(id).score) == OrderedFloat(score) =>
            {
                id
            }
            _ => return,
        };

        let target_links = self.node(target).links.clone();
        for i in 0..self.level {
            let l = self.link_mut(update[i], i);
            if l.forward == Some(target) {
                l.span += target_links[i].span;
                l.span -= 1;
                l.forward = target_links[i].forward;
            } else {
                l.span -= 1;
            }
        }

        let backward = self.node(target).backward;
        match target_links[0].forward {
            Some(next) => self.arena[next as usize].backward = backward,
            None => self.tail = backward,
        }

        while self.level > 1 && self.head[self.level - 1].forward.is_none() {
            self.head[self.level - 1].span = 0;
            self.level -= 1;
        }
        self.len -= 1;
        self.free.push(target);
        // leave the node in the arena; the free list recycles the slot
        self.arena[target as usize].member.clear();
    }

    /// 1-based rank of the exact (member, score) pair, or `None`.
    fn rank(&self, member: &str, score: f64) -> Option<u64> {
        let mut rank = 0u64;
        let mut x: Option<u32> = None;
        for i in (0..self.level).rev() {
            loop {
                let link = self.link(x, i);
                match link.forward {
                    Some(next) => {
                        let n = self.node(next);
                        let le = Self::key_less(n.score, &n.member, score, member)
                            || (OrderedFloat(n.score) == OrderedFloat(score)
                                && n.member == member);
                        if le {
                            rank += link.span as u64;
                            x = Some(next);
                        } else {
                            break;
                        }
                    }
                    None => break,
                }
            }
            if let Some(id) = x {
                if self.node(id).member == member {
                    return Some(rank);
                }
            }
        }
        None
    }

    /// Node id at 1-based rank.
    fn by_rank(&self, rank: u64) -> Option<u32> {
        if rank == 0 || rank > self.len as u64 {
            return None;
        }
        let mut traversed = 0u64;
        let mut x: Option<u32> = None;
        for i in (0..self.level).rev() {
            loop {
                let link = self.link(x, i);
                match link.forward {
                    Some(next) if traversed + link.span as u64 <= rank => {
                        traversed += link.span as u64;
                        x = Some(next);
                        if traversed == rank {
                            return x;
                        }
                    }
                    _ => break,
                }
            }
        }
        None
    }

    /// First node admitted by `min`, scanning by score order.
    fn first_in_range(&self, min: &ScoreBound) -> Option<u32> {
        let mut x: Option<u32> = None;
        for i in (0..self.level).rev() {
            loop {
                let link = self.link(x, i);
                match link.forward {
                    Some(next) if !min.admits_as_min(self.node(next).score) => {
                        x = Some(next);
                    }
                    _ => break,
                }
            }
        }
        self.link(x, 0).forward
    }

    fn iter_from(&self, start: Option<u32>) -> SkipIter<'_> {
        SkipIter {
            list: self,
            cursor: start,
        }
    }

    fn iter(&self) -> SkipIter<'_> {
        self.iter_from(self.head[0].forward)
    }
}

struct SkipIter<'a> {
    list: &'a SkipList,
    cursor: Option<u32>,
}

impl<'a> Iterator for SkipIter<'a> {
    type Item = (&'a str, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = self.list.node(id);
        self.cursor = node.links[0].forward;
        Some((&node.member, node.score))
    }
}

/// The public sorted-set entity.
pub struct SortedSet {
    list: SkipList,
    scores: AHashMap<String, f64>,
}

impl Default for SortedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SortedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedSet").field("len", &self.len()).finish()
    }
}

impl Clone for SortedSet {
    fn clone(&self) -> Self {
        let mut copy = SortedSet::new();
        for (member, score) in self.iter() {
            copy.add(member.to_owned(), score);
        }
        copy
    }
}

impl SortedSet {
    /// Creates an empty sorted set.
    pub fn new() -> Self {
        Self {
            list: SkipList::new(),
            scores: AHashMap::new(),
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// `true` when no members are stored.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Adds a member or updates its score. Returns `true` when the
    /// member was newly added.
    pub fn add(&mut self, member: String, score: f64) -> bool {
        match self.scores.get(&member) {
            Some(&old) => {
                if OrderedFloat(old) != OrderedFloat(score) {
                    self.list.remove(&member, old);
                    self.list.insert(member.clone(), score);
                    self.scores.insert(member, score);
                }
                false
            }
            None => {
                self.list.insert(member.clone(), score);
                self.scores.insert(member, score);
                true
            }
        }
    }

    /// Removes a member. Returns `true` if it existed.
    pub fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.list.remove(member, score);
                true
            }
            None => false,
        }
    }

    /// The member's score, if present.
    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// 0-based rank, lowest score first (or highest when `rev`).
    pub fn rank(&self, member: &str, rev: bool) -> Option<u64> {
        let score = self.score(member)?;
        let rank = self.list.rank(member, score)?;
        if rev {
            Some(self.len() as u64 - rank)
        } else {
            Some(rank - 1)
        }
    }

    /// Iterates all members in (score, member) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.list.iter()
    }

    /// Members at 0-based ranks `[start, stop)`, optionally reversed.
    pub fn range_by_rank(&self, start: u64, stop: u64, rev: bool) -> Vec<(String, f64)> {
        if start >= stop || start >= self.len() as u64 {
            return Vec::new();
        }
        let count = (stop.min(self.len() as u64) - start) as usize;
        if rev {
            // rank r in reverse order is rank len-1-r forward
            let first_fwd = self.len() as u64 - start; // 1-based
            let mut out = Vec::with_capacity(count);
            let mut cursor = self.list.by_rank(first_fwd);
            for _ in 0..count {
                let Some(id) = cursor else { break };
                let node = self.list.node(id);
                out.push((node.member.clone(), node.score));
                cursor = node.backward;
            }
            out
        } else {
            let start_id = self.list.by_rank(start + 1);
            self.list
                .iter_from(start_id)
                .take(count)
                .map(|(m, s)| (m.to_owned(), s))
                .collect()
        }
    }

    /// Members whose score lies within `[min, max]`, in ascending
    /// order (or descending when `rev`).
    pub fn range_by_score(&self, min: &ScoreBound, max: &ScoreBound, rev: bool) -> Vec<(String, f64)> {
        let start = self.list.first_in_range(min);
        let mut out: Vec<(String, f64)> = self
            .list
            .iter_from(start)
            .take_while(|(_, score)| max.admits_as_max(*score))
            .map(|(m, s)| (m.to_owned(), s))
            .collect();
        if rev {
            out.reverse();
        }
        out
    }

    /// Number of members with score in `[min, max]`. 0 for an empty set.
    pub fn count_by_score(&self, min: &ScoreBound, max: &ScoreBound) -> usize {
        let start = self.list.first_in_range(min);
        self.list
            .iter_from(start)
            .take_while(|(_, score)| max.admits_as_max(*score))
            .count()
    }

    /// Removes members with score in `[min, max]`; returns them.
    pub fn remove_range_by_score(&mut self, min: &ScoreBound, max: &ScoreBound) -> Vec<(String, f64)> {
        let doomed = self.range_by_score(min, max, false);
        for (member, _) in &doomed {
            self.remove(member);
        }
        doomed
    }

    /// Removes members at 0-based ranks `[start, stop)`; returns them.
    pub fn remove_range_by_rank(&mut self, start: u64, stop: u64) -> Vec<(String, f64)> {
        let doomed = self.range_by_rank(start, stop, false);
        for (member, _) in &doomed {
            self.remove(member);
        }
        doomed
    }

    /// Removes and returns up to `count` lowest-scored members.
    pub fn pop_min(&mut self, count: usize) -> Vec<(String, f64)> {
        self.remove_range_by_rank(0, count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SortedSet {
        let mut z = SortedSet::new();
        z.add("a".into(), 1.0);
        z.add("b".into(), 2.0);
        z.add("c".into(), 3.0);
        z.add("d".into(), 4.0);
        z
    }

    #[test]
    fn add_and_score() {
        let mut z = SortedSet::new();
        assert!(z.add("m".into(), 1.5));
        assert!(!z.add("m".into(), 2.5));
        assert_eq!(z.score("m"), Some(2.5));
        assert_eq!(z.score("missing"), None);
        assert_eq!(z.len(), 1);
    }

    #[test]
    fn remove_member() {
        let mut z = sample();
        assert!(z.remove("b"));
        assert!(!z.remove("b"));
        assert_eq!(z.len(), 3);
        assert_eq!(z.score("b"), None);
        let members: Vec<_> = z.iter().map(|(m, _)| m.to_owned()).collect();
        assert_eq!(members, vec!["a", "c", "d"]);
    }

    #[test]
    fn ordering_breaks_score_ties_by_member() {
        let mut z = SortedSet::new();
        z.add("beta".into(), 1.0);
        z.add("alpha".into(), 1.0);
        z.add("gamma".into(), 1.0);
        let members: Vec<_> = z.iter().map(|(m, _)| m.to_owned()).collect();
        assert_eq!(members, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn rank_forward_and_reverse() {
        let z = sample();
        assert_eq!(z.rank("a", false), Some(0));
        assert_eq!(z.rank("d", false), Some(3));
        assert_eq!(z.rank("a", true), Some(3));
        assert_eq!(z.rank("d", true), Some(0));
        assert_eq!(z.rank("zz", false), None);
    }

    #[test]
    fn rank_survives_updates() {
        let mut z = sample();
        z.add("a".into(), 10.0); // moves to the end
        assert_eq!(z.rank("a", false), Some(3));
        assert_eq!(z.rank("b", false), Some(0));
    }

    #[test]
    fn range_by_rank_window() {
        let z = sample();
        let out = z.range_by_rank(1, 3, false);
        assert_eq!(
            out,
            vec![("b".to_string(), 2.0), ("c".to_string(), 3.0)]
        );
    }

    #[test]
    fn range_by_rank_reverse() {
        let z = sample();
        let out = z.range_by_rank(0, 2, true);
        assert_eq!(
            out,
            vec![("d".to_string(), 4.0), ("c".to_string(), 3.0)]
        );
    }

    #[test]
    fn range_by_rank_out_of_bounds() {
        let z = sample();
        assert!(z.range_by_rank(10, 20, false).is_empty());
        assert_eq!(z.range_by_rank(2, 100, false).len(), 2);
    }

    #[test]
    fn range_by_score_inclusive() {
        let z = sample();
        let out = z.range_by_score(
            &ScoreBound::Value {
                score: 2.0,
                exclusive: false,
            },
            &ScoreBound::Value {
                score: 3.0,
                exclusive: false,
            },
            false,
        );
        assert_eq!(
            out,
            vec![("b".to_string(), 2.0), ("c".to_string(), 3.0)]
        );
    }

    #[test]
    fn range_by_score_exclusive_and_inf() {
        let z = sample();
        let out = z.range_by_score(
            &ScoreBound::Value {
                score: 2.0,
                exclusive: true,
            },
            &ScoreBound::PosInf,
            false,
        );
        assert_eq!(
            out,
            vec![("c".to_string(), 3.0), ("d".to_string(), 4.0)]
        );
    }

    #[test]
    fn count_by_score() {
        let z = sample();
        assert_eq!(z.count_by_score(&ScoreBound::NegInf, &ScoreBound::PosInf), 4);
        assert_eq!(
            z.count_by_score(
                &ScoreBound::Value {
                    score: 2.0,
                    exclusive: false
                },
                &ScoreBound::Value {
                    score: 4.0,
                    exclusive: true
                }
            ),
            2
        );
        let empty = SortedSet::new();
        assert_eq!(empty.count_by_score(&ScoreBound::NegInf, &ScoreBound::PosInf), 0);
    }

    #[test]
    fn remove_range_by_score() {
        let mut z = sample();
        let gone = z.remove_range_by_score(
            &ScoreBound::Value {
                score: 2.0,
                exclusive: false,
            },
            &ScoreBound::Value {
                score: 3.0,
                exclusive: false,
            },
        );
        assert_eq!(gone.len(), 2);
        assert_eq!(z.len(), 2);
        assert_eq!(z.score("b"), None);
    }

    #[test]
    fn pop_min_returns_lowest() {
        let mut z = sample();
        let popped = z.pop_min(2);
        assert_eq!(
            popped,
            vec![("a".to_string(), 1.0), ("b".to_string(), 2.0)]
        );
        assert_eq!(z.len(), 2);
    }

    #[test]
    fn bound_parsing() {
        assert_eq!(ScoreBound::parse(b"-inf"), Some(ScoreBound::NegInf));
        assert_eq!(ScoreBound::parse(b"+inf"), Some(ScoreBound::PosInf));
        assert_eq!(
            ScoreBound::parse(b"3.5"),
            Some(ScoreBound::Value {
                score: 3.5,
                exclusive: false
            })
        );
        assert_eq!(
            ScoreBound::parse(b"(3.5"),
            Some(ScoreBound::Value {
                score: 3.5,
                exclusive: true
            })
        );
        assert_eq!(ScoreBound::parse(b"abc"), None);
    }

    #[test]
    fn large_set_rank_consistency() {
        let mut z = SortedSet::new();
        for i in 0..500 {
            z.add(format!("m{i:04}"), i as f64);
        }
        assert_eq!(z.len(), 500);
        for probe in [0u64, 1, 250, 498, 499] {
            assert_eq!(z.rank(&format!("m{probe:04}"), false), Some(probe));
        }
        // remove odd members and re-check ranks of the evens
        for i in (1..500).step_by(2) {
            z.remove(&format!("m{i:04}"));
        }
        assert_eq!(z.len(), 250);
        assert_eq!(z.rank("m0000", false), Some(0));
        assert_eq!(z.rank("m0250", false), Some(125));
        assert_eq!(z.rank("m0498", false), Some(249));
    }
}
