use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Submitted form fields, in submission order.
pub type FormPayload = Vec<(String, String)>;

/// A write that could not be delivered and waits for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWriteRecord {
  /// Primary key. Strictly increasing, derived from `captured_at` in milliseconds.
  pub key: i64,
  pub payload: FormPayload,
  /// Where the write was headed; replay goes to the same URL.
  pub target_url: Url,
  pub captured_at: DateTime<Utc>,
}

/// First value submitted under `field`.
pub fn field_value<'a>(payload: &'a [(String, String)], field: &str) -> Option<&'a str> {
  payload
    .iter()
    .find(|(name, _)| name == field)
    .map(|(_, value)| value.as_str())
}
