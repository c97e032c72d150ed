//! In-memory persistence: sessions, lesson progress, placements and tiers.
//!
//! `find_active` and `create` are deliberately separate operations so a
//! returning child resumes instead of silently getting a fresh session.
//! Each session also has a turn lock; holding it is what makes a
//! read-modify-save of that session exclusive. A lock entry lives only while
//! someone holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, instrument};

use crate::domain::{Phase, Tier};
use crate::scoring::{PlacementPrompt, TierAssignment};
use crate::session::Session;

type ChildLesson = (String, String);
type TurnLocks = Arc<SyncMutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonProgress {
  pub child_id: String,
  pub lesson_id: String,
  pub session_id: String,
  pub phase: Phase,
  pub score: Option<f64>,
  pub updated_at: DateTime<Utc>,
}

impl LessonProgress {
  pub fn of(session: &Session) -> Self {
    Self {
      child_id: session.child_id.clone(),
      lesson_id: session.lesson_id.clone(),
      session_id: session.id.clone(),
      phase: session.phase,
      score: session.final_score.as_ref().map(|s| s.overall_score),
      updated_at: session.updated_at,
    }
  }
}

/// Prompts handed out by `placement/start`, awaiting responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRecord {
  pub id: String,
  pub child_id: String,
  pub prompts: Vec<PlacementPrompt>,
  pub created_at: DateTime<Utc>,
  /// Normalized per-prompt scores once submitted.
  #[serde(default)]
  pub scores: Option<Vec<f64>>,
}

#[derive(Default)]
pub struct SessionStore {
  sessions: RwLock<HashMap<String, Session>>,
  active: RwLock<HashMap<ChildLesson, String>>,
  turn_locks: TurnLocks,
  progress: RwLock<HashMap<ChildLesson, LessonProgress>>,
  placements: RwLock<HashMap<String, PlacementRecord>>,
  tiers: RwLock<HashMap<String, TierAssignment>>,
}

impl SessionStore {
  pub fn new() -> Self { Self::default() }

  /// The child's unfinished session for this lesson, if any.
  #[instrument(level = "debug", skip(self))]
  pub async fn find_active(&self, child_id: &str, lesson_id: &str) -> Option<Session> {
    let id = {
      let active = self.active.read().await;
      active.get(&(child_id.to_string(), lesson_id.to_string())).cloned()?
    };
    self.sessions.read().await.get(&id).filter(|s| s.is_active()).cloned()
  }

  #[instrument(level = "debug", skip(self, session), fields(session_id = %session.id))]
  pub async fn create(&self, session: Session) {
    let key = (session.child_id.clone(), session.lesson_id.clone());
    self.active.write().await.insert(key, session.id.clone());
    self.sessions.write().await.insert(session.id.clone(), session);
  }

  pub async fn get(&self, session_id: &str) -> Option<Session> {
    self.sessions.read().await.get(session_id).cloned()
  }

  /// Persist a committed session. Finished sessions drop out of `find_active`.
  #[instrument(level = "debug", skip(self, session), fields(session_id = %session.id, phase = %session.phase))]
  pub async fn save(&self, session: &Session) {
    if !session.is_active() {
      let key = (session.child_id.clone(), session.lesson_id.clone());
      let mut active = self.active.write().await;
      if active.get(&key) == Some(&session.id) {
        active.remove(&key);
        debug!(target: "coach", session_id = %session.id, "Session finished; no longer active");
      }
    }
    self.sessions.write().await.insert(session.id.clone(), session.clone());
  }

  /// Exclusive turn lock for one session. Hold it across read, generate and save.
  pub async fn lock_session(&self, session_id: &str) -> TurnGuard {
    let lock = {
      let mut locks = self.turn_locks.lock().unwrap_or_else(PoisonError::into_inner);
      locks.entry(session_id.to_string()).or_default().clone()
    };
    TurnGuard { key: session_id.to_string(), guard: Some(lock.lock_owned().await), locks: self.turn_locks.clone() }
  }

  #[cfg(test)]
  fn turn_lock_count(&self) -> usize { self.turn_locks.lock().unwrap_or_else(PoisonError::into_inner).len() }

  pub async fn upsert_progress(&self, progress: LessonProgress) {
    let key = (progress.child_id.clone(), progress.lesson_id.clone());
    self.progress.write().await.insert(key, progress);
  }

  pub async fn progress(&self, child_id: &str, lesson_id: &str) -> Option<LessonProgress> {
    self.progress.read().await.get(&(child_id.to_string(), lesson_id.to_string())).cloned()
  }

  pub async fn save_placement(&self, record: PlacementRecord) {
    self.placements.write().await.insert(record.id.clone(), record);
  }

  pub async fn get_placement(&self, placement_id: &str) -> Option<PlacementRecord> {
    self.placements.read().await.get(placement_id).cloned()
  }

  pub async fn tier_assignment(&self, child_id: &str) -> Option<TierAssignment> {
    self.tiers.read().await.get(child_id).cloned()
  }

  /// Record a placement outcome. A parent's earlier choice survives.
  pub async fn set_recommended(&self, child_id: &str, placement_scores: Vec<f64>, now: DateTime<Utc>) -> TierAssignment {
    let mut tiers = self.tiers.write().await;
    let mut fresh = TierAssignment::from_placement(child_id, placement_scores, now);
    if let Some(prev) = tiers.get(child_id) {
      fresh.assigned_tier = prev.assigned_tier;
    }
    tiers.insert(child_id.to_string(), fresh.clone());
    fresh
  }

  /// Record a parent override. The placement recommendation survives.
  pub async fn assign_tier(&self, child_id: &str, tier: Tier, now: DateTime<Utc>) -> TierAssignment {
    let mut tiers = self.tiers.write().await;
    let entry = tiers.entry(child_id.to_string()).or_insert_with(|| TierAssignment::unplaced(child_id, now));
    entry.assign(tier, now);
    entry.clone()
  }
}

/// Held turn lock. Dropping it releases the lock and forgets the entry once
/// no other task holds or waits on it.
pub struct TurnGuard {
  key: String,
  guard: Option<OwnedMutexGuard<()>>,
  locks: TurnLocks,
}

impl Drop for TurnGuard {
  fn drop(&mut self) {
    self.guard.take();
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
      locks.remove(&self.key);
    }
  }
}
