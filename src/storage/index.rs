//! Inverted content index with LRU word eviction and a hot-word cache.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

/// Longest word (in bytes) that is indexed.
pub const MAX_INDEX_WORD_LENGTH: usize = 50;
/// Shortest word (in bytes) that is indexed.
pub(crate) const MIN_INDEX_WORD_LENGTH: usize = 2;
/// Unique words indexed per thought; the rest are dropped.
pub const MAX_UNIQUE_WORDS_PER_THOUGHT: usize = 1000;
/// Number of distinct words the index holds before evicting.
pub const MAX_INDEX_SIZE: usize = 100_000;
/// Lookups of a word before it is promoted to the hot cache.
pub(crate) const HOT_WORD_THRESHOLD: u32 = 5;
/// Maximum number of hot words.
pub(crate) const HOT_WORD_CAPACITY: usize = 100;

/// Split text into unique, lowercased index words.
///
/// Each whitespace-separated word is lowercased and trimmed of leading and
/// trailing characters outside ASCII `[a-z0-9]`. Words keep their
/// first-occurrence order. Only the first [`MAX_UNIQUE_WORDS_PER_THOUGHT`]
/// unique words are returned.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    collect_words(text, |c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Split a query into full-text search terms.
///
/// Same bounds as [`tokenize`], but any Unicode alphanumeric character may
/// end a word, matching SQLite's `unicode61` tokenizer.
pub(crate) fn fts_terms(text: &str) -> Vec<String> {
    collect_words(text, char::is_alphanumeric)
}

fn collect_words(text: &str, is_word_char: fn(char) -> bool) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut words = Vec::new();
    let mut dropped = 0usize;

    for raw in text.split_whitespace() {
        let lowered = raw.to_lowercase();
        let word = lowered.trim_matches(|c: char| !is_word_char(c));
        if word.len() < MIN_INDEX_WORD_LENGTH || word.len() > MAX_INDEX_WORD_LENGTH {
            continue;
        }
        if seen.contains(word) {
            continue;
        }
        if words.len() >= MAX_UNIQUE_WORDS_PER_THOUGHT {
            dropped += 1;
            continue;
        }
        seen.insert(word.to_string());
        words.push(word.to_string());
    }

    if dropped > 0 {
        warn!(
            limit = MAX_UNIQUE_WORDS_PER_THOUGHT,
            dropped, "Unique word limit reached, remaining words not indexed"
        );
    }
    words
}

#[derive(Debug, Default)]
struct Posting {
    ids: Vec<String>,
    last_access: u64,
    hits: u32,
}

/// Word -> thought ID postings.
///
/// Recency is tracked with a logical clock in an ordered set, so eviction
/// pops the oldest words without scanning the whole index. Evicting a word
/// only makes it unsearchable; the thoughts themselves are untouched.
#[derive(Debug)]
pub(crate) struct ContentIndex {
    postings: HashMap<String, Posting>,
    recency: BTreeSet<(u64, String)>,
    hot: HashMap<String, Vec<String>>,
    clock: u64,
    capacity: usize,
}

impl Default for ContentIndex {
    fn default() -> Self {
        Self::with_capacity(MAX_INDEX_SIZE)
    }
}

impl ContentIndex {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            postings: HashMap::new(),
            recency: BTreeSet::new(),
            hot: HashMap::new(),
            clock: 0,
            capacity: capacity.max(1),
        }
    }

    /// Number of indexed words.
    pub(crate) fn len(&self) -> usize {
        self.postings.len()
    }

    #[cfg(test)]
    pub(crate) fn contains_word(&self, word: &str) -> bool {
        self.postings.contains_key(word)
    }

    #[cfg(test)]
    pub(crate) fn is_hot(&self, word: &str) -> bool {
        self.hot.contains_key(word)
    }

    #[cfg(test)]
    pub(crate) fn hot_len(&self) -> usize {
        self.hot.len()
    }

    /// Index `id` under each word, evicting old words whenever a new word
    /// would not fit.
    pub(crate) fn insert(&mut self, id: &str, words: &[String]) {
        for word in words {
            if !self.postings.contains_key(word) && self.postings.len() >= self.capacity {
                self.evict_oldest((self.capacity / 10).max(1));
            }
            let stamp = self.tick();
            let posting = self.postings.entry(word.clone()).or_default();
            if posting.last_access > 0 {
                self.recency.remove(&(posting.last_access, word.clone()));
            }
            posting.last_access = stamp;
            if !posting.ids.iter().any(|existing| existing == id) {
                posting.ids.push(id.to_string());
                if let Some(hot) = self.hot.get_mut(word) {
                    hot.push(id.to_string());
                }
            }
            self.recency.insert((stamp, word.clone()));
        }
    }

    /// Remove `id` from the postings of `words`. Words left empty are dropped.
    pub(crate) fn remove(&mut self, id: &str, words: &[String]) {
        for word in words {
            let Some(posting) = self.postings.get_mut(word) else {
                continue;
            };
            posting.ids.retain(|existing| existing != id);
            if let Some(hot) = self.hot.get_mut(word) {
                hot.retain(|existing| existing != id);
            }
            if posting.ids.is_empty() {
                let stamp = posting.last_access;
                self.postings.remove(word);
                self.recency.remove(&(stamp, word.clone()));
                self.hot.remove(word);
            }
        }
    }

    /// Look up a word, checking the hot cache first.
    ///
    /// Counts as an access for eviction and promotion.
    pub(crate) fn lookup(&mut self, word: &str) -> Option<&[String]> {
        let stamp = self.tick();
        let posting = self.postings.get_mut(word)?;

        self.recency.remove(&(posting.last_access, word.to_string()));
        posting.last_access = stamp;
        self.recency.insert((stamp, word.to_string()));

        if self.hot.contains_key(word) {
            return self.hot.get(word).map(Vec::as_slice);
        }

        posting.hits += 1;
        if posting.hits >= HOT_WORD_THRESHOLD && self.hot.len() < HOT_WORD_CAPACITY {
            self.hot.insert(word.to_string(), posting.ids.clone());
            debug!(word, "Promoted word to hot cache");
            return self.hot.get(word).map(Vec::as_slice);
        }

        self.postings.get(word).map(|p| p.ids.as_slice())
    }

    fn evict_oldest(&mut self, count: usize) {
        let mut evicted = 0usize;
        while evicted < count {
            let Some((_, word)) = self.recency.pop_first() else {
                break;
            };
            self.postings.remove(&word);
            self.hot.remove(&word);
            evicted += 1;
        }
        debug!(
            evicted,
            remaining = self.postings.len(),
            "Evicted least recently used index words"
        );
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
