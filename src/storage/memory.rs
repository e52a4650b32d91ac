//! Concurrent in-memory backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::copy::{detach, detach_all};
use super::ids::IdGenerator;
use super::index::{tokenize, ContentIndex};
use super::{
    Branch, CrossRef, Insight, Metrics, Relationship, Storage, ThinkingMode, Thought, Validation,
};
use crate::error::{EntityKind, StorageError, StorageResult};

/// Upper bound (and default) for a search page.
pub const MAX_SEARCH_RESULTS: usize = 1000;
/// Length of the recently-accessed branch stack.
pub const MAX_RECENT_BRANCHES: usize = 10;

/// Clamp a requested page size to `1..=MAX_SEARCH_RESULTS`; zero means the cap.
pub(crate) fn clamp_limit(limit: usize) -> usize {
    if limit == 0 || limit > MAX_SEARCH_RESULTS {
        MAX_SEARCH_RESULTS
    } else {
        limit
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    thoughts: HashMap<String, Arc<Thought>>,
    branches: HashMap<String, Arc<Branch>>,
    insights: HashMap<String, Arc<Insight>>,
    validations: HashMap<String, Arc<Validation>>,
    relationships: HashMap<String, Arc<Relationship>>,

    /// Newest timestamp first; ties keep the most recently stored first.
    thoughts_ordered: Vec<Arc<Thought>>,
    /// Branch IDs, newest `created_at` first.
    branches_ordered: Vec<String>,

    content_index: ContentIndex,
    mode_index: HashMap<ThinkingMode, Vec<String>>,

    /// Insight ID -> owning branch ID.
    insight_owners: HashMap<String, String>,

    active_branch_id: Option<String>,
    /// Most recent first, no duplicates.
    recent_branch_ids: VecDeque<String>,
}

fn replace_or_push<T>(items: &mut Vec<T>, item: T, id_of: fn(&T) -> &str) {
    match items.iter().position(|existing| id_of(existing) == id_of(&item)) {
        Some(pos) => items[pos] = item,
        None => items.push(item),
    }
}

impl MemoryState {
    fn with_index_capacity(capacity: usize) -> Self {
        Self {
            content_index: ContentIndex::with_capacity(capacity),
            ..Self::default()
        }
    }

    fn insert_thought(&mut self, thought: Arc<Thought>) {
        if let Some(previous) = self.thoughts.remove(&thought.id) {
            self.unindex_thought(&previous);
        }

        let words = tokenize(&thought.content);
        self.content_index.insert(&thought.id, &words);
        self.mode_index
            .entry(thought.mode)
            .or_default()
            .push(thought.id.clone());

        let pos = self
            .thoughts_ordered
            .partition_point(|t| t.timestamp > thought.timestamp);
        self.thoughts_ordered.insert(pos, Arc::clone(&thought));
        self.thoughts.insert(thought.id.clone(), thought);
    }

    /// Store a thought and keep branch aggregates in step with its
    /// `branch_id`: it leaves its previous branch and joins the new one.
    fn save_thought(&mut self, thought: Thought) {
        let previous_owner = self
            .thoughts
            .get(&thought.id)
            .and_then(|t| t.branch_id.clone())
            .filter(|old| thought.branch_id.as_ref() != Some(old));
        if let Some(old) = previous_owner {
            if let Some(branch) = self.branches.get_mut(&old).map(Arc::make_mut) {
                branch.thoughts.retain(|t| t.id != thought.id);
            }
        }
        if let Some(owner) = thought.branch_id.as_deref() {
            if let Some(branch) = self.branches.get_mut(owner).map(Arc::make_mut) {
                replace_or_push(&mut branch.thoughts, thought.clone(), |t| t.id.as_str());
            }
        }
        self.insert_thought(Arc::new(thought));
    }

    /// Store an insight, refreshing its copy inside the owning branch.
    fn save_insight(&mut self, insight: Insight) {
        if let Some(owner) = self.insight_owners.get(&insight.id) {
            if let Some(branch) = self.branches.get_mut(owner).map(Arc::make_mut) {
                replace_or_push(&mut branch.insights, insight.clone(), |i| i.id.as_str());
            }
        }
        self.insights.insert(insight.id.clone(), Arc::new(insight));
    }

    /// Make `branch_id` the owner of an insight, removing it from any
    /// previous owner.
    fn claim_insight(&mut self, insight_id: &str, branch_id: &str) {
        let previous = self
            .insight_owners
            .insert(insight_id.to_string(), branch_id.to_string());
        if let Some(old) = previous.filter(|old| old != branch_id) {
            if let Some(branch) = self.branches.get_mut(&old).map(Arc::make_mut) {
                branch.insights.retain(|i| i.id != insight_id);
            }
        }
    }

    /// Upsert a branch aggregate. Its thoughts and insights are stored as
    /// entities owned by it; those it no longer carries are released but
    /// kept. Does not touch active/recent state.
    fn put_branch(&mut self, mut branch: Branch) {
        let branch_id = branch.id.clone();
        for thought in &mut branch.thoughts {
            thought.branch_id = Some(branch_id.clone());
        }

        let kept: HashSet<&str> = branch.thoughts.iter().map(|t| t.id.as_str()).collect();
        let released: Vec<String> = self
            .thoughts
            .values()
            .filter(|t| t.branch_id.as_deref() == Some(branch_id.as_str()))
            .filter(|t| !kept.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect();
        for id in released {
            if let Some(mut thought) = self.thoughts.get(&id).map(|t| Thought::clone(t)) {
                thought.branch_id = None;
                self.insert_thought(Arc::new(thought));
            }
        }

        let kept: HashSet<&str> = branch.insights.iter().map(|i| i.id.as_str()).collect();
        self.insight_owners
            .retain(|insight_id, owner| owner != &branch_id || kept.contains(insight_id.as_str()));

        for thought in &branch.thoughts {
            self.save_thought(thought.clone());
        }
        for insight in &branch.insights {
            self.claim_insight(&insight.id, &branch_id);
            self.insights
                .insert(insight.id.clone(), Arc::new(insight.clone()));
        }

        self.upsert_branch(Arc::new(branch));
    }

    fn unindex_thought(&mut self, previous: &Thought) {
        self.content_index
            .remove(&previous.id, &tokenize(&previous.content));
        if let Some(ids) = self.mode_index.get_mut(&previous.mode) {
            ids.retain(|id| id != &previous.id);
        }
        self.thoughts_ordered.retain(|t| t.id != previous.id);
    }

    fn upsert_branch(&mut self, branch: Arc<Branch>) {
        if self.branches.contains_key(&branch.id) {
            self.branches.insert(branch.id.clone(), branch);
            return;
        }

        let branches = &self.branches;
        let pos = self.branches_ordered.partition_point(|id| {
            branches
                .get(id)
                .is_some_and(|b| b.created_at > branch.created_at)
        });
        self.branches_ordered.insert(pos, branch.id.clone());
        self.branches.insert(branch.id.clone(), branch);
    }

    fn track_recent_branch(&mut self, branch_id: &str) {
        self.recent_branch_ids.retain(|id| id != branch_id);
        self.recent_branch_ids.push_front(branch_id.to_string());
        self.recent_branch_ids.truncate(MAX_RECENT_BRANCHES);
    }

    fn branch_mut(&mut self, branch_id: &str) -> StorageResult<&mut Branch> {
        self.branches
            .get_mut(branch_id)
            .map(Arc::make_mut)
            .ok_or_else(|| StorageError::not_found(EntityKind::Branch, branch_id))
    }

    /// Union of the postings of `words`, restricted to `mode` when set.
    fn word_candidates(&mut self, words: &[String], mode: Option<ThinkingMode>) -> HashSet<String> {
        let mut candidates = HashSet::new();
        for word in words {
            let Some(ids) = self.content_index.lookup(word) else {
                continue;
            };
            for id in ids {
                let mode_matches = match mode {
                    Some(mode) => self.thoughts.get(id).is_some_and(|t| t.mode == mode),
                    None => true,
                };
                if mode_matches {
                    candidates.insert(id.clone());
                }
            }
        }
        candidates
    }

    fn mode_candidates(&self, mode: ThinkingMode) -> HashSet<String> {
        self.mode_index
            .get(&mode)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Walk the ordered projection, skipping `offset` matches.
    fn page(
        &self,
        candidates: Option<&HashSet<String>>,
        limit: usize,
        offset: usize,
    ) -> Vec<Arc<Thought>> {
        let mut results = Vec::new();
        let mut skipped = 0usize;
        for thought in &self.thoughts_ordered {
            if let Some(candidates) = candidates {
                if !candidates.contains(&thought.id) {
                    continue;
                }
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if results.len() >= limit {
                break;
            }
            results.push(Arc::clone(thought));
        }
        results
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = Metrics {
            total_thoughts: self.thoughts.len(),
            total_branches: self.branches.len(),
            total_insights: self.insights.len(),
            total_validations: self.validations.len(),
            total_relationships: self.relationships.len(),
            ..Metrics::default()
        };

        let mut confidence_sum = 0.0;
        for thought in self.thoughts.values() {
            *metrics
                .thoughts_by_mode
                .entry(thought.mode.to_string())
                .or_default() += 1;
            confidence_sum += thought.confidence;
        }
        if !self.thoughts.is_empty() {
            metrics.average_confidence = confidence_sum / self.thoughts.len() as f64;
        }
        metrics
    }
}

/// In-memory [`Storage`] backend.
///
/// All state sits behind one reader/writer lock. Reads clone the entity
/// `Arc` under the lock and build the owned copy after releasing it; branch
/// mutation is copy-on-write, so a reader never observes a half-applied
/// change.
#[derive(Debug)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    ids: IdGenerator,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            ids: IdGenerator::new(),
        }
    }

    /// Create an empty store whose content index evicts at `capacity` words.
    pub fn with_index_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::with_index_capacity(capacity)),
            ids: IdGenerator::new(),
        }
    }

    /// Number of words currently searchable.
    pub async fn indexed_word_count(&self) -> usize {
        self.state.read().await.content_index.len()
    }

    pub(crate) async fn contains_branch(&self, branch_id: &str) -> bool {
        self.state.read().await.branches.contains_key(branch_id)
    }

    /// Cache a branch loaded from elsewhere without changing the active
    /// branch or the recent stack.
    pub(crate) async fn cache_branch(&self, branch: Branch) {
        let mut state = self.state.write().await;
        state.put_branch(branch);
    }

    /// Load branches ordered most recently accessed first, making the first
    /// one active and rebuilding the recent stack from them.
    pub(crate) async fn restore_branches(&self, branches: Vec<Branch>) {
        let mut state = self.state.write().await;
        let mut recent = VecDeque::new();
        for branch in branches {
            if recent.len() < MAX_RECENT_BRANCHES {
                recent.push_back(branch.id.clone());
            }
            state.put_branch(branch);
        }
        state.active_branch_id = recent.front().cloned();
        state.recent_branch_ids = recent;
        debug!(
            branches = state.branches.len(),
            active = ?state.active_branch_id,
            "Restored branch state"
        );
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_thought(&self, mut thought: Thought) -> StorageResult<String> {
        self.ids.assign(&mut thought.id, "thought");
        let id = thought.id.clone();

        let mut state = self.state.write().await;
        state.save_thought(thought);
        Ok(id)
    }

    async fn get_thought(&self, id: &str) -> StorageResult<Thought> {
        let stored = self.state.read().await.thoughts.get(id).cloned();
        stored
            .map(detach)
            .ok_or_else(|| StorageError::not_found(EntityKind::Thought, id))
    }

    async fn search_thoughts(
        &self,
        query: &str,
        mode: Option<ThinkingMode>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<Thought>> {
        let limit = clamp_limit(limit);
        let words = tokenize(query);

        let matches = if words.is_empty() {
            let state = self.state.read().await;
            match mode {
                Some(mode) => {
                    let candidates = state.mode_candidates(mode);
                    state.page(Some(&candidates), limit, offset)
                }
                None => state.page(None, limit, offset),
            }
        } else {
            let mut state = self.state.write().await;
            let candidates = state.word_candidates(&words, mode);
            state.page(Some(&candidates), limit, offset)
        };

        Ok(detach_all(matches))
    }

    async fn store_branch(&self, mut branch: Branch) -> StorageResult<String> {
        self.ids.assign(&mut branch.id, "branch");
        if branch.last_accessed_at.is_none() {
            branch.last_accessed_at = Some(Utc::now());
        }
        for thought in &mut branch.thoughts {
            self.ids.assign(&mut thought.id, "thought");
        }
        for insight in &mut branch.insights {
            self.ids.assign(&mut insight.id, "insight");
        }
        for cross_ref in &mut branch.cross_refs {
            self.ids.assign(&mut cross_ref.id, "xref");
        }
        let id = branch.id.clone();

        let mut state = self.state.write().await;
        state.put_branch(branch);
        if state.active_branch_id.is_none() {
            state.active_branch_id = Some(id.clone());
            state.track_recent_branch(&id);
        }
        Ok(id)
    }

    async fn get_branch(&self, id: &str) -> StorageResult<Branch> {
        let stored = self.state.read().await.branches.get(id).cloned();
        stored
            .map(detach)
            .ok_or_else(|| StorageError::not_found(EntityKind::Branch, id))
    }

    async fn list_branches(&self) -> StorageResult<Vec<Branch>> {
        let stored: Vec<Arc<Branch>> = {
            let state = self.state.read().await;
            state
                .branches_ordered
                .iter()
                .filter_map(|id| state.branches.get(id).cloned())
                .collect()
        };
        Ok(detach_all(stored))
    }

    async fn get_active_branch(&self) -> StorageResult<Branch> {
        let (active_id, stored) = {
            let state = self.state.read().await;
            let active_id = state.active_branch_id.clone();
            let stored = active_id
                .as_ref()
                .and_then(|id| state.branches.get(id).cloned());
            (active_id, stored)
        };

        let active_id = active_id.ok_or(StorageError::NoActiveBranch)?;
        stored.map(detach).ok_or_else(|| StorageError::DataInconsistency {
            message: format!("active branch {} no longer exists", active_id),
        })
    }

    async fn set_active_branch(&self, branch_id: &str) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if !state.branches.contains_key(branch_id) {
            return Err(StorageError::BranchUnavailable {
                branch_id: branch_id.to_string(),
                available: state.branches_ordered.clone(),
            });
        }

        state.branch_mut(branch_id)?.last_accessed_at = Some(Utc::now());
        state.active_branch_id = Some(branch_id.to_string());
        state.track_recent_branch(branch_id);
        Ok(())
    }

    async fn update_branch_access(&self, branch_id: &str) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state.branch_mut(branch_id)?.last_accessed_at = Some(Utc::now());
        state.track_recent_branch(branch_id);
        Ok(())
    }

    async fn append_thought_to_branch(
        &self,
        branch_id: &str,
        thought: &Thought,
    ) -> StorageResult<()> {
        let mut item = thought.clone();
        self.ids.assign(&mut item.id, "thought");
        item.branch_id = Some(branch_id.to_string());

        let mut state = self.state.write().await;
        state.branch_mut(branch_id)?.updated_at = Utc::now();
        state.save_thought(item);
        Ok(())
    }

    async fn append_insight_to_branch(
        &self,
        branch_id: &str,
        insight: &Insight,
    ) -> StorageResult<()> {
        let mut item = insight.clone();
        self.ids.assign(&mut item.id, "insight");

        let mut state = self.state.write().await;
        state.branch_mut(branch_id)?.updated_at = Utc::now();
        state.claim_insight(&item.id, branch_id);
        state.save_insight(item);
        Ok(())
    }

    async fn append_cross_ref_to_branch(
        &self,
        branch_id: &str,
        cross_ref: &CrossRef,
    ) -> StorageResult<()> {
        let mut item = cross_ref.clone();
        self.ids.assign(&mut item.id, "xref");

        let mut state = self.state.write().await;
        let branch = state.branch_mut(branch_id)?;
        replace_or_push(&mut branch.cross_refs, item, |x| x.id.as_str());
        branch.updated_at = Utc::now();
        Ok(())
    }

    async fn update_branch_priority(&self, branch_id: &str, priority: f64) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let branch = state.branch_mut(branch_id)?;
        branch.priority = priority;
        branch.updated_at = Utc::now();
        Ok(())
    }

    async fn update_branch_confidence(
        &self,
        branch_id: &str,
        confidence: f64,
    ) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let branch = state.branch_mut(branch_id)?;
        branch.confidence = confidence;
        branch.updated_at = Utc::now();
        Ok(())
    }

    async fn get_recent_branches(&self) -> StorageResult<Vec<Branch>> {
        let stored: Vec<Arc<Branch>> = {
            let state = self.state.read().await;
            state
                .recent_branch_ids
                .iter()
                .filter_map(|id| state.branches.get(id).cloned())
                .collect()
        };
        Ok(detach_all(stored))
    }

    async fn store_insight(&self, mut insight: Insight) -> StorageResult<String> {
        self.ids.assign(&mut insight.id, "insight");
        let id = insight.id.clone();
        self.state.write().await.save_insight(insight);
        Ok(id)
    }

    async fn get_insight(&self, id: &str) -> StorageResult<Insight> {
        let stored = self.state.read().await.insights.get(id).cloned();
        stored
            .map(detach)
            .ok_or_else(|| StorageError::not_found(EntityKind::Insight, id))
    }

    async fn store_validation(&self, mut validation: Validation) -> StorageResult<String> {
        self.ids.assign(&mut validation.id, "validation");
        let id = validation.id.clone();
        self.state
            .write()
            .await
            .validations
            .insert(id.clone(), Arc::new(validation));
        Ok(id)
    }

    async fn get_validation(&self, id: &str) -> StorageResult<Validation> {
        let stored = self.state.read().await.validations.get(id).cloned();
        stored
            .map(detach)
            .ok_or_else(|| StorageError::not_found(EntityKind::Validation, id))
    }

    async fn store_relationship(&self, mut relationship: Relationship) -> StorageResult<String> {
        self.ids.assign(&mut relationship.id, "rel");
        let id = relationship.id.clone();
        self.state
            .write()
            .await
            .relationships
            .insert(id.clone(), Arc::new(relationship));
        Ok(id)
    }

    async fn get_relationship(&self, id: &str) -> StorageResult<Relationship> {
        let stored = self.state.read().await.relationships.get(id).cloned();
        stored
            .map(detach)
            .ok_or_else(|| StorageError::not_found(EntityKind::Relationship, id))
    }

    async fn get_metrics(&self) -> StorageResult<Metrics> {
        Ok(self.state.read().await.metrics())
    }
}
