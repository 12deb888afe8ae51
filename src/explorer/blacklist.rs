use std::collections::{BTreeSet, HashMap};

/// Known-infeasible address sequences collected during one search session.
///
/// Entries only ever accumulate. A candidate path is rejected when any entry occurs in
/// it as a contiguous run, which covers both full prefixes and the trimmed suffix-only
/// prefixes produced by failure diagnosis.
#[derive(Debug, Default, Clone)]
pub struct Blacklist {
    entries: BTreeSet<Vec<usize>>,
    by_head: HashMap<usize, Vec<Vec<usize>>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the sequence was empty or already present.
    pub fn add(&mut self, seq: Vec<usize>) -> bool {
        let Some(&head) = seq.first() else {
            return false;
        };
        if !self.entries.insert(seq.clone()) {
            return false;
        }
        self.by_head.entry(head).or_default().push(seq);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, seq: &[usize]) -> bool {
        self.entries.contains(seq)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Vec<usize>> + '_ {
        self.entries.iter()
    }

    /// True if any blacklisted sequence occurs contiguously inside `path`.
    pub fn rejects(&self, path: &[usize]) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        path.iter().enumerate().any(|(i, addr)| {
            self.by_head
                .get(addr)
                .map(|seqs| seqs.iter().any(|seq| path[i..].starts_with(seq)))
                .unwrap_or(false)
        })
    }
}
