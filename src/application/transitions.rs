use crate::domain::event::{ChangeEvent, Notification, Operation, Severity};
use crate::domain::ports::NotificationSinkRef;
use crate::domain::quote::{QuoteStatus, ViewerRole};
use crate::error::{Result, SyncError};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error};

/// A status change as seen by one viewer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionKey {
    pub role: ViewerRole,
    /// `None` for inserts.
    pub old: Option<QuoteStatus>,
    pub new: QuoteStatus,
}

/// Lookup from `(viewer role, old status, new status)` to a user-facing notice.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    entries: HashMap<TransitionKey, Notification>,
}

impl TransitionTable {
    /// A table with no notices.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Notices for the quotes table.
    pub fn quotes() -> Self {
        use QuoteStatus::*;
        use ViewerRole::*;

        Self::empty()
            .with(Owner, Some(Pending), Accepted, Notification::new(
                "Quote accepted",
                "A quote on your project was accepted.",
                Severity::Success,
            ))
            .with(Owner, Some(Pending), Declined, Notification::new(
                "Quote declined",
                "A quote on your project was declined.",
                Severity::Info,
            ))
            .with(Counterpart, None, Pending, Notification::new(
                "New quote",
                "A new quote was created.",
                Severity::Info,
            ))
            .with(Counterpart, Some(Pending), Accepted, Notification::new(
                "Quote accepted",
                "Your quote was accepted.",
                Severity::Success,
            ))
            .with(Counterpart, Some(Pending), Declined, Notification::new(
                "Quote declined",
                "Your quote was declined.",
                Severity::Warning,
            ))
    }

    /// Adds the notice shown to `role` when a row moves from `old` to `new`.
    pub fn with(
        mut self,
        role: ViewerRole,
        old: Option<QuoteStatus>,
        new: QuoteStatus,
        notification: Notification,
    ) -> Self {
        self.entries.insert(TransitionKey { role, old, new }, notification);
        self
    }

    /// The notice for `key`, if the transition is announced at all.
    pub fn lookup(&self, key: &TransitionKey) -> Option<&Notification> {
        self.entries.get(key)
    }
}

fn status_of(row: Option<&Value>) -> Result<Option<QuoteStatus>> {
    match row.and_then(|row| row.get("status")) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(status)) => status.parse().map(Some),
        Some(other) => Err(SyncError::InvariantViolation(format!(
            "status field is not a string: {other}"
        ))),
    }
}

/// Derives the status transition carried by an event, if any.
///
/// Inserts yield `old: None`. Updates without a status change, deletes, and row images
/// without a status yield nothing. A change out of a terminal status is a contract breach.
pub fn transition_of(event: &ChangeEvent, role: ViewerRole) -> Result<Option<TransitionKey>> {
    match event.operation {
        Operation::Delete => Ok(None),
        Operation::Insert => Ok(status_of(event.new_row.as_ref())?
            .map(|new| TransitionKey { role, old: None, new })),
        Operation::Update => {
            let old = status_of(event.old_row.as_ref())?;
            let new = status_of(event.new_row.as_ref())?;
            match (old, new) {
                (Some(old), Some(new)) if old != new => {
                    if old.is_terminal() {
                        return Err(SyncError::InvariantViolation(format!(
                            "quote {} moved out of terminal status {old} to {new}",
                            event.row_id().unwrap_or("<unknown>")
                        )));
                    }
                    Ok(Some(TransitionKey { role, old: Some(old), new }))
                }
                _ => Ok(None),
            }
        }
    }
}

/// Transitions remembered per listener for duplicate suppression.
pub(crate) const SEEN_CAPACITY: usize = 1024;

type SeenTransition = (String, Option<QuoteStatus>, QuoteStatus);

/// Per-listener notification dispatch, idempotent per observed `(row, old, new)`.
///
/// Only the most recent [`SEEN_CAPACITY`] transitions are remembered; redeliveries are
/// expected shortly after the original signal.
pub(crate) struct NotificationDispatcher {
    role: ViewerRole,
    table: Arc<TransitionTable>,
    sink: NotificationSinkRef,
    seen: HashSet<SeenTransition>,
    seen_order: VecDeque<SeenTransition>,
}

impl NotificationDispatcher {
    pub(crate) fn new(role: ViewerRole, table: Arc<TransitionTable>, sink: NotificationSinkRef) -> Self {
        Self {
            role,
            table,
            sink,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Returns `false` when the transition was already seen.
    fn remember(&mut self, transition: SeenTransition) -> bool {
        if !self.seen.insert(transition.clone()) {
            return false;
        }
        self.seen_order.push_back(transition);
        if self.seen_order.len() > SEEN_CAPACITY
            && let Some(oldest) = self.seen_order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }

    /// Returns `true` when a notification was sent.
    pub(crate) fn dispatch(&mut self, event: &ChangeEvent) -> bool {
        let transition = match transition_of(event, self.role) {
            Ok(Some(transition)) => transition,
            Ok(None) => return false,
            Err(err) => {
                error!(table = %event.table, filter = %event.filter, error = %err, "rejecting change event");
                return false;
            }
        };

        let row = event.row_id().unwrap_or_default().to_string();
        if !self.remember((row.clone(), transition.old, transition.new)) {
            debug!(row = %row, "duplicate transition signal, notification already sent");
            return false;
        }

        match self.table.lookup(&transition) {
            Some(notification) => {
                self.sink.notify(notification.clone());
                true
            }
            None => false,
        }
    }
}
