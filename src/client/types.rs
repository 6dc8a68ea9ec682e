//! Domain types for the restaurant-operations API.
//!
//! Everything here is serde-round-trippable: cached payloads are stored as
//! JSON, so domain types double as their own wire format.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A recurring checklist definition, e.g. "FOH opening" or "line close".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
  pub id: u64,
  pub title: String,
  /// Station the list belongs to ("foh", "boh", "prep", ...).
  pub area: Option<String>,
  #[serde(default)]
  pub active: bool,
  pub updated_at: Option<String>,
}

/// Reference to a task list as the API returns it.
///
/// Older endpoints return a bare id, newer ones embed the whole list.
/// Normalizing into one union at the boundary keeps call sites free of
/// shape checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListRef {
  Id(u64),
  Embedded(TaskList),
}

impl ListRef {
  pub fn id(&self) -> u64 {
    match self {
      ListRef::Id(id) => *id,
      ListRef::Embedded(list) => list.id,
    }
  }

  /// The embedded list, when the API sent one.
  pub fn embedded(&self) -> Option<&TaskList> {
    match self {
      ListRef::Id(_) => None,
      ListRef::Embedded(list) => Some(list),
    }
  }
}

/// Completion state of a single task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Completed,
  Missed,
}

/// One dated occurrence of a checklist task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
  pub id: u64,
  pub list: ListRef,
  pub due_date: NaiveDate,
  pub status: TaskStatus,
  pub completed_by: Option<String>,
  pub completed_at: Option<DateTime<Utc>>,
  pub notes: Option<String>,
}

/// Payload for creating a task instance.
#[derive(Debug, Clone, Serialize)]
pub struct NewTaskInstance {
  pub list_id: u64,
  pub due_date: NaiveDate,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

/// Partial update for a task instance. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub completed_by: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

/// A logged waste event (spoilage, overproduction, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasteEntry {
  pub id: u64,
  pub item: String,
  pub quantity: f64,
  pub unit: String,
  pub reason: String,
  pub date: NaiveDate,
  pub recorded_at: DateTime<Utc>,
}

/// Payload for recording a waste event.
#[derive(Debug, Clone, Serialize)]
pub struct NewWasteEntry {
  pub item: String,
  pub quantity: f64,
  pub unit: String,
  pub reason: String,
  pub date: NaiveDate,
}
