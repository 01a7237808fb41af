use super::ids::{ProjectId, QuoteId, UserId};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a quote: `pending`, then `accepted` or `declined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteStatus {
    Pending,
    Accepted,
    Declined,
}

impl QuoteStatus {
    /// `accepted` and `declined` admit no further mutation.
    pub fn is_terminal(self) -> bool {
        !matches!(self, QuoteStatus::Pending)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            QuoteStatus::Pending => "pending",
            QuoteStatus::Accepted => "accepted",
            QuoteStatus::Declined => "declined",
        }
    }
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuoteStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QuoteStatus::Pending),
            "accepted" => Ok(QuoteStatus::Accepted),
            "declined" => Ok(QuoteStatus::Declined),
            other => Err(SyncError::InvariantViolation(format!(
                "unrecognized quote status '{other}'"
            ))),
        }
    }
}

/// A negotiation record between a project owner (client) and a counterpart (freelancer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub project_id: ProjectId,
    pub client_id: UserId,
    pub freelancer_id: UserId,
    pub status: QuoteStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    /// Identity on the other side of the negotiation from `role`.
    pub fn counterpart_of(&self, role: ViewerRole) -> &UserId {
        match role {
            ViewerRole::Owner => &self.freelancer_id,
            ViewerRole::Counterpart => &self.client_id,
        }
    }
}

/// Public projection of a user profile, attached to quotes for display.
///
/// Missing profiles are represented by the default (empty) projection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileProjection {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub headline: String,
}

impl ProfileProjection {
    /// Placeholder for a user without a profile row.
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }
}

/// A quote with the counterpart's profile attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuoteWithProfile {
    pub quote: Quote,
    pub profile: ProfileProjection,
}

/// Side of the marketplace a viewer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerRole {
    /// Owns the project and receives quotes (client).
    Owner,
    /// Submits quotes against someone else's project (freelancer).
    Counterpart,
}

/// The authenticated user a query runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewer {
    pub id: UserId,
    pub role: ViewerRole,
}

impl Viewer {
    /// A project owner viewing quotes they received.
    pub fn owner(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            role: ViewerRole::Owner,
        }
    }

    /// A counterpart viewing quotes they submitted.
    pub fn counterpart(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            role: ViewerRole::Counterpart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_status_terminality() {
        assert!(!QuoteStatus::Pending.is_terminal());
        assert!(QuoteStatus::Accepted.is_terminal());
        assert!(QuoteStatus::Declined.is_terminal());
    }

    #[test]
    fn test_unknown_quote_status_is_invariant_violation() {
        assert_eq!("accepted".parse::<QuoteStatus>().unwrap(), QuoteStatus::Accepted);
        assert!(matches!(
            "withdrawn".parse::<QuoteStatus>(),
            Err(SyncError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_counterpart_of() {
        let now = Utc::now();
        let quote = Quote {
            id: "q1".into(),
            project_id: "p1".into(),
            client_id: "client".into(),
            freelancer_id: "freelancer".into(),
            status: QuoteStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(quote.counterpart_of(ViewerRole::Owner).as_str(), "freelancer");
        assert_eq!(quote.counterpart_of(ViewerRole::Counterpart).as_str(), "client");
    }
}
