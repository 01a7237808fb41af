use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A push subscription target: a table plus a row filter such as `project_id=eq.p1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub table: String,
    pub filter: String,
}

impl EntityKey {
    /// Key for `table` with a raw `filter` expression.
    pub fn new(table: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: filter.into(),
        }
    }

    /// Key for every row of `table` whose `column` equals `value`.
    pub fn eq(table: impl Into<String>, column: &str, value: impl fmt::Display) -> Self {
        Self::new(table, format!("{column}=eq.{value}"))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.filter)
    }
}

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One mutation delivered by the push transport.
///
/// Delivery is at-least-once and unordered across filters, so consumers treat it as a
/// signal to refetch and only read `status` out of the row images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: Operation,
    pub table: String,
    pub filter: String,
    pub old_row: Option<Value>,
    pub new_row: Option<Value>,
}

impl ChangeEvent {
    /// The subscription key this event was delivered on.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.table.clone(), self.filter.clone())
    }

    /// Primary key of the mutated row, taken from whichever image is present.
    pub fn row_id(&self) -> Option<&str> {
        self.new_row
            .as_ref()
            .or(self.old_row.as_ref())
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
    }
}

/// How prominently a notice is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing notice handed to the notification sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub severity: Severity,
}

impl Notification {
    /// Builds a notice from its parts.
    pub fn new(title: impl Into<String>, body: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            severity,
        }
    }
}
