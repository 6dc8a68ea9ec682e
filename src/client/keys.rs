//! Cache keys for operations-API queries.

use chrono::NaiveDate;

use crate::cache::QueryKey;

/// Query key for each cacheable read.
///
/// Parameters are embedded in normalized form: areas lowercased, dates in
/// ISO form. That keeps equal queries on one key and lets a mutation for a
/// given service date invalidate every query containing it.
#[derive(Debug, Clone)]
pub enum OpsQueryKey {
  /// All task lists, optionally scoped to an area.
  TaskLists { area: Option<String> },
  /// Task instances over a date range, optionally scoped to an area.
  TaskInstances {
    from: NaiveDate,
    to: NaiveDate,
    area: Option<String>,
  },
  /// One task instance by id.
  InstanceDetail { id: u64 },
  /// Waste entries for a service date.
  WasteEntries { date: NaiveDate },
}

fn normalize_area(area: &Option<String>) -> String {
  area
    .as_deref()
    .map(|a| a.trim().to_lowercase())
    .unwrap_or_default()
}

impl QueryKey for OpsQueryKey {
  fn family(&self) -> &'static str {
    match self {
      Self::TaskLists { .. } => "lists",
      Self::TaskInstances { .. } | Self::InstanceDetail { .. } => "instances",
      Self::WasteEntries { .. } => "waste",
    }
  }

  fn params(&self) -> String {
    match self {
      Self::TaskLists { area } => normalize_area(area),
      Self::TaskInstances { from, to, area } => {
        format!("{}:{}:{}", from, to, normalize_area(area))
      }
      Self::InstanceDetail { id } => format!("detail:{id}"),
      Self::WasteEntries { date } => date.to_string(),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::TaskLists { area } => match area {
        Some(a) => format!("task lists for {a}"),
        None => "all task lists".to_string(),
      },
      Self::TaskInstances { from, to, area } => match area {
        Some(a) => format!("task instances {from}..{to} for {a}"),
        None => format!("task instances {from}..{to}"),
      },
      Self::InstanceDetail { id } => format!("task instance {id}"),
      Self::WasteEntries { date } => format!("waste entries for {date}"),
    }
  }
}
