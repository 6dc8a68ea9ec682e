//! Cache key derivation for API queries.

/// A logical query that can be cached.
///
/// Implementors produce a deterministic, readable key: two requests with
/// equal parameters must map to the same key. Keys embed their parameters in
/// normalized form (ISO dates, lowercased filters) so that
/// substring-based invalidation works, e.g. dropping every cached query that
/// touches a given service date.
pub trait QueryKey {
  /// Resource family prefix, e.g. "lists" or "instances". Mutations
  /// invalidate a whole family at once.
  fn family(&self) -> &'static str;

  /// Normalized parameter portion of the key (no family prefix).
  fn params(&self) -> String;

  /// Full cache key, `family:params`.
  fn cache_key(&self) -> String {
    format!("{}:{}", self.family(), self.params())
  }

  /// Human-readable description for log lines.
  fn description(&self) -> String {
    self.cache_key()
  }
}
