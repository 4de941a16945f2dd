// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable, key-less set of user facts (C4 Memory Store).
//!
//! Unlike the flat `update_memory` tool (a plain key-value JSON blob meant
//! for ad-hoc scratch state), [`MemoryStore`] holds free-form facts the
//! agent has learned about the user across sessions, deduplicated by
//! normalized content, ranked by relevance, and confidence-decayed over
//! time so stale facts fade out instead of accumulating forever.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Coarse classification of a memory, used for category bias and per-category
/// confidence decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Routine,
    Relationship,
}

impl MemoryCategory {
    /// Static weight applied as the "category bias" term of the relevance score.
    fn bias(self) -> f32 {
        match self {
            MemoryCategory::Fact => 1.0,
            MemoryCategory::Relationship => 0.9,
            MemoryCategory::Preference => 0.85,
            MemoryCategory::Routine => 0.75,
        }
    }

    /// Confidence multiplier applied to unselected memories on each
    /// `getForPrompt` call. Facts are assumed durable and decay slowly;
    /// routines (easily superseded) decay fastest.
    fn decay_factor(self) -> f32 {
        match self {
            MemoryCategory::Fact => 0.995,
            MemoryCategory::Relationship => 0.99,
            MemoryCategory::Preference => 0.98,
            MemoryCategory::Routine => 0.97,
        }
    }
}

/// How durable the fact is expected to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temporal {
    Permanent,
    Recurring,
    OneTime,
}

/// A single remembered fact about the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub device_id: String,
    pub category: MemoryCategory,
    pub temporal: Temporal,
    pub confidence: f32,
    /// Flat back-references to related memory ids (not a graph store).
    pub related: Vec<String>,
}

/// Normalize content for duplicate detection: lowercase, trimmed.
fn normalize(content: &str) -> String {
    content.trim().to_lowercase()
}

/// Confidence gained each time a memory is explicitly accessed.
const ACCESS_BOOST: f32 = 0.05;
/// Memories whose confidence falls below this threshold are pruned on decay.
const PRUNE_THRESHOLD: f32 = 0.05;
/// Concurrent `modified_at` edits within this window are flagged as a conflict.
const CONFLICT_WINDOW: i64 = 5; // seconds

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("duplicate memory content")]
    DuplicateContent,
    #[error("unknown memory id: {0}")]
    UnknownId(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OnDisk {
    memories: Vec<Memory>,
}

/// File-backed store for memories, guarded by a single writer lock.
///
/// All mutations pass through the lock; `getForPrompt` takes a cloned
/// snapshot under the lock just long enough to score and decay, so it never
/// blocks a concurrent `add`.
pub struct MemoryStore {
    path: PathBuf,
    device_id: String,
    inner: Mutex<OnDisk>,
}

impl MemoryStore {
    /// Open (or lazily create) the store backed by `path`, tagging new
    /// memories with `device_id`.
    pub fn open(path: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        let path = path.into();
        let inner = load(&path).unwrap_or_default();
        Self {
            path,
            device_id: device_id.into(),
            inner: Mutex::new(inner),
        }
    }

    /// Default location: `~/.config/sven/memories.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("sven")
            .join("memories.json")
    }

    /// A stable identifier for the current machine, used to tag memories
    /// created here so multi-device merges can tell devices apart.
    /// Falls back to `"local"` when the hostname cannot be determined.
    pub fn local_device_id() -> String {
        std::env::var("SVEN_DEVICE_ID")
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| std::env::var("COMPUTERNAME").ok())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "local".to_string())
    }

    /// Add a new memory. Rejects content whose normalized form already
    /// matches an existing memory.
    pub fn add(
        &self,
        content: impl Into<String>,
        category: MemoryCategory,
        temporal: Temporal,
    ) -> Result<Memory, MemoryError> {
        let content = content.into();
        let normalized = normalize(&content);

        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        if guard
            .memories
            .iter()
            .any(|m| normalize(&m.content) == normalized)
        {
            return Err(MemoryError::DuplicateContent);
        }

        let now = Utc::now();
        let memory = Memory {
            id: Uuid::new_v4().to_string(),
            content,
            created_at: now,
            modified_at: now,
            device_id: self.device_id.clone(),
            category,
            temporal,
            confidence: 1.0,
            related: Vec::new(),
        };
        guard.memories.push(memory.clone());
        save(&self.path, &guard)?;
        Ok(memory)
    }

    /// Score memories against `recent_topics` and return the top-ranked ones
    /// whose cumulative approximate token cost (chars / 4) stays under
    /// `token_cap`. Memories not selected have their confidence decayed by
    /// their category's decay factor; memories that fall below
    /// [`PRUNE_THRESHOLD`] afterward are removed.
    pub fn get_for_prompt(&self, recent_topics: &[String], token_cap: usize) -> Vec<Memory> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let now = Utc::now();

        let topics: Vec<String> = recent_topics.iter().map(|t| t.to_lowercase()).collect();

        let mut scored: Vec<(f32, usize)> = guard
            .memories
            .iter()
            .enumerate()
            .map(|(idx, m)| (score(m, &topics, now), idx))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected_idx = std::collections::HashSet::new();
        let mut budget = 0usize;
        for (_, idx) in &scored {
            let cost = approx_tokens(&guard.memories[*idx].content);
            if budget + cost > token_cap && !selected_idx.is_empty() {
                break;
            }
            selected_idx.insert(*idx);
            budget += cost;
        }

        let result: Vec<Memory> = selected_idx.iter().map(|&i| guard.memories[i].clone()).collect();

        for (idx, m) in guard.memories.iter_mut().enumerate() {
            if !selected_idx.contains(&idx) {
                m.confidence = (m.confidence * m.category.decay_factor()).clamp(0.0, 1.0);
            }
        }
        guard.memories.retain(|m| m.confidence >= PRUNE_THRESHOLD);

        let _ = save(&self.path, &guard);

        let mut result = result;
        result.sort_by(|a, b| {
            score(b, &topics, now)
                .partial_cmp(&score(a, &topics, now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        result
    }

    /// Boost a memory's confidence (capped at 1.0) and refresh `modified_at`.
    pub fn access(&self, id: &str) -> Result<Memory, MemoryError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let memory = guard
            .memories
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| MemoryError::UnknownId(id.to_string()))?;
        memory.confidence = (memory.confidence + ACCESS_BOOST).min(1.0);
        memory.modified_at = Utc::now();
        let result = memory.clone();
        save(&self.path, &guard)?;
        Ok(result)
    }

    /// Remove a memory by id. Returns `true` if it existed.
    pub fn remove(&self, id: &str) -> Result<bool, MemoryError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let before = guard.memories.len();
        guard.memories.retain(|m| m.id != id);
        let removed = guard.memories.len() != before;
        if removed {
            save(&self.path, &guard)?;
        }
        Ok(removed)
    }

    /// Remove all memories.
    pub fn clear(&self) -> Result<(), MemoryError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        guard.memories.clear();
        save(&self.path, &guard)
    }

    /// Return a snapshot of all memories, for sync/merge purposes.
    pub fn snapshot(&self) -> Vec<Memory> {
        self.inner.lock().expect("memory store lock poisoned").memories.clone()
    }

    /// Merge a remote device's snapshot into this store.
    ///
    /// Per-id conflict resolution: the memory with the later `modified_at`
    /// wins; ids unique to either side are unioned in. When both sides
    /// modified the same id within [`CONFLICT_WINDOW`] seconds of each
    /// other, the conflict is logged (a genuine simultaneous edit) but the
    /// later timestamp still wins deterministically, with `device_id` as
    /// the final tiebreak — this is explicitly *not* naive last-write-wins,
    /// since non-conflicting ids from both sides are always preserved.
    pub fn merge(&self, remote: Vec<Memory>) -> Result<(), MemoryError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let mut by_id: std::collections::HashMap<String, Memory> = guard
            .memories
            .drain(..)
            .map(|m| (m.id.clone(), m))
            .collect();

        for incoming in remote {
            match by_id.get(&incoming.id) {
                None => {
                    by_id.insert(incoming.id.clone(), incoming);
                }
                Some(existing) => {
                    let delta = (incoming.modified_at - existing.modified_at)
                        .num_seconds()
                        .abs();
                    if delta <= CONFLICT_WINDOW && existing.modified_at != incoming.modified_at {
                        warn!(
                            id = %incoming.id,
                            local_device = %existing.device_id,
                            remote_device = %incoming.device_id,
                            "concurrent memory edit detected, picking newer modified_at"
                        );
                    }
                    let winner = if incoming.modified_at > existing.modified_at {
                        incoming
                    } else if incoming.modified_at < existing.modified_at {
                        existing.clone()
                    } else if incoming.device_id > existing.device_id {
                        incoming
                    } else {
                        existing.clone()
                    };
                    by_id.insert(winner.id.clone(), winner);
                }
            }
        }

        guard.memories = by_id.into_values().collect();
        save(&self.path, &guard)
    }
}

/// Weighted relevance score: topic overlap 40%, confidence 30%, recency 20%,
/// category bias 10%.
fn score(memory: &Memory, topics: &[String], now: DateTime<Utc>) -> f32 {
    let overlap = topic_overlap(&memory.content, topics);
    let recency = recency_score(memory.modified_at, now);
    overlap * 0.4 + memory.confidence * 0.3 + recency * 0.2 + memory.category.bias() * 0.1
}

fn topic_overlap(content: &str, topics: &[String]) -> f32 {
    if topics.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let hits = topics.iter().filter(|t| content_lower.contains(t.as_str())).count();
    hits as f32 / topics.len() as f32
}

/// Recency decays to ~0 over roughly 30 days, clamped to [0, 1].
fn recency_score(modified_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_days = (now - modified_at).num_seconds().max(0) as f32 / 86_400.0;
    (1.0 - age_days / 30.0).clamp(0.0, 1.0)
}

fn approx_tokens(content: &str) -> usize {
    (content.len() / 4).max(1)
}

fn load(path: &Path) -> Option<OnDisk> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Atomic replace: serialize to a sibling `.tmp` file, then rename over the
/// destination.
fn save(path: &Path, data: &OnDisk) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(data)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tmp_store() -> (MemoryStore, PathBuf) {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir()
            .join(format!("sven_memory_store_test_{}_{n}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        (MemoryStore::open(&path, "device-a"), path)
    }

    #[test]
    fn add_rejects_duplicate_normalized_content() {
        let (store, path) = tmp_store();
        store.add("Likes Rust", MemoryCategory::Preference, Temporal::Permanent).unwrap();
        let err = store
            .add("  likes rust  ", MemoryCategory::Preference, Temporal::Permanent)
            .unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateContent));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn add_sets_full_confidence_and_device_id() {
        let (store, path) = tmp_store();
        let m = store.add("works at Acme", MemoryCategory::Fact, Temporal::Permanent).unwrap();
        assert_eq!(m.confidence, 1.0);
        assert_eq!(m.device_id, "device-a");
        assert_eq!(m.created_at, m.modified_at);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn access_boosts_confidence_and_caps_at_one() {
        let (store, path) = tmp_store();
        let m = store.add("drinks coffee", MemoryCategory::Routine, Temporal::Recurring).unwrap();
        let boosted = store.access(&m.id).unwrap();
        // Confidence already at 1.0, boost should still clamp at 1.0.
        assert_eq!(boosted.confidence, 1.0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn get_for_prompt_prefers_topic_overlap() {
        let (store, path) = tmp_store();
        store.add("prefers dark mode editors", MemoryCategory::Preference, Temporal::Permanent).unwrap();
        store.add("lives in Stockholm", MemoryCategory::Fact, Temporal::Permanent).unwrap();

        let topics = vec!["editors".to_string()];
        let top = store.get_for_prompt(&topics, 1000);
        assert_eq!(top[0].content, "prefers dark mode editors");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn get_for_prompt_decays_unselected_memories() {
        let (store, path) = tmp_store();
        store.add("routine: standup at 9am", MemoryCategory::Routine, Temporal::Recurring).unwrap();
        store.add("relevant topic memory", MemoryCategory::Fact, Temporal::Permanent).unwrap();

        let topics = vec!["relevant".to_string()];
        // Tiny token cap so only the top-scored memory is selected.
        let _ = store.get_for_prompt(&topics, 3);

        let snapshot = store.snapshot();
        let standup = snapshot.iter().find(|m| m.content.contains("standup")).unwrap();
        assert!(standup.confidence < 1.0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn remove_deletes_memory() {
        let (store, path) = tmp_store();
        let m = store.add("temp fact", MemoryCategory::Fact, Temporal::OneTime).unwrap();
        assert!(store.remove(&m.id).unwrap());
        assert!(!store.remove(&m.id).unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn clear_empties_store() {
        let (store, path) = tmp_store();
        store.add("a", MemoryCategory::Fact, Temporal::Permanent).unwrap();
        store.add("b", MemoryCategory::Fact, Temporal::Permanent).unwrap();
        store.clear().unwrap();
        assert!(store.snapshot().is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn merge_unions_distinct_ids_from_both_devices() {
        let (store, path) = tmp_store();
        store.add("local fact", MemoryCategory::Fact, Temporal::Permanent).unwrap();

        let remote = vec![Memory {
            id: Uuid::new_v4().to_string(),
            content: "remote fact".into(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
            device_id: "device-b".into(),
            category: MemoryCategory::Fact,
            temporal: Temporal::Permanent,
            confidence: 1.0,
            related: vec![],
        }];
        store.merge(remote).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn merge_picks_later_modified_at_for_same_id() {
        let (store, path) = tmp_store();
        let local = store.add("shared fact", MemoryCategory::Fact, Temporal::Permanent).unwrap();

        let mut newer = local.clone();
        newer.device_id = "device-b".into();
        newer.content = "shared fact updated".into();
        newer.modified_at = local.modified_at + Duration::hours(1);

        store.merge(vec![newer.clone()]).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, "shared fact updated");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn persists_across_reopen() {
        let (store, path) = tmp_store();
        store.add("persisted fact", MemoryCategory::Fact, Temporal::Permanent).unwrap();
        drop(store);

        let reopened = MemoryStore::open(&path, "device-a");
        assert_eq!(reopened.snapshot().len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn local_device_id_is_never_empty() {
        assert!(!MemoryStore::local_device_id().is_empty());
    }
}
