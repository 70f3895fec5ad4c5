//! Labels (one side of an arc) and per-side vocabularies that intern them.

use std::sync::Arc;

use crate::concurrent_map::ConcurrentMap;
use crate::hash::hash_bytes;
use crate::pool::StringPool;

/// One side of an arc: a raw hash of the whole string plus the hashes of
/// its `|`-separated tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub raw: u64,
    pub tokens: Vec<u64>,
}

impl Label {
    fn parse(text: &str, pool: &StringPool) -> Self {
        let raw = pool.intern_str(text, false);
        let tokens = text
            .split('|')
            .map(|tok| pool.intern_str(tok, false))
            .collect();
        Self { raw, tokens }
    }

    /// Hash of token `idx`, or the equal-comparison sentinel callers expect
    /// when the token index is out of range (spec leaves this case to the
    /// dataset loader's validation; here we just return `raw` for index 0
    /// as a defensive default so label lookups never panic).
    pub fn token(&self, idx: usize) -> u64 {
        self.tokens.get(idx).copied().unwrap_or(self.raw)
    }
}

/// Unique small id for an interned label within one vocabulary.
pub type LabelId = u32;

/// Interns label text into shared [`Label`] objects: two arcs referring to
/// the same textual label share the same `LabelId`.
pub struct Vocab {
    by_hash: ConcurrentMap<(LabelId, Label)>,
    by_id: parking_lot::RwLock<Vec<Arc<Label>>>,
}

impl Vocab {
    pub fn new() -> Self {
        Self {
            by_hash: ConcurrentMap::new(),
            by_id: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Intern `text`, returning the shared `LabelId`.
    ///
    /// The id for a genuinely new string is derived from `by_id`'s length
    /// while holding its write lock for the whole insert-and-push critical
    /// section, so id assignment and push order can never diverge under
    /// concurrent callers interning distinct new strings: whichever thread
    /// acquires the lock first both claims the next id and pushes at it
    /// before anyone else can observe (or claim) that length.
    pub fn intern(&self, text: &str, pool: &StringPool) -> LabelId {
        let key = hash_bytes(text.as_bytes());
        if let Some(existing) = self.by_hash.find(key) {
            return existing.0;
        }
        let label = Label::parse(text, pool);
        let mut by_id = self.by_id.write();
        let id = by_id.len() as LabelId;
        let entry = self.by_hash.insert(key, (id, label.clone()));
        // Lost the race against another thread inserting the same text
        // first: use the id that won, and don't grow `by_id` for ours.
        let winning_id = entry.0;
        if winning_id == id {
            by_id.push(Arc::new(label));
        }
        winning_id
    }

    pub fn get(&self, id: LabelId) -> Arc<Label> {
        Arc::clone(&self.by_id.read()[id as usize])
    }

    pub fn len(&self) -> usize {
        self.by_id.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_shares_label_id() {
        let pool = StringPool::new(true);
        let vocab = Vocab::new();
        let a = vocab.intern("foo|bar", &pool);
        let b = vocab.intern("foo|bar", &pool);
        assert_eq!(a, b);
        assert_eq!(vocab.len(), 1);
    }

    #[test]
    fn different_text_gets_distinct_ids() {
        let pool = StringPool::new(true);
        let vocab = Vocab::new();
        let a = vocab.intern("foo", &pool);
        let b = vocab.intern("bar", &pool);
        assert_ne!(a, b);
    }

    #[test]
    fn token_split_on_pipe() {
        let pool = StringPool::new(true);
        let vocab = Vocab::new();
        let id = vocab.intern("a|b|c", &pool);
        let label = vocab.get(id);
        assert_eq!(label.tokens.len(), 3);
    }
}
