use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wraps `value` without validation.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// The raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of an authenticated user (client, freelancer, or credit holder).
    UserId
);
string_id!(
    /// Identity of a project that receives quotes.
    ProjectId
);
string_id!(
    /// Primary key of a quote row.
    QuoteId
);
string_id!(
    /// Reference handed out by the payment collaborator for one checkout session.
    ///
    /// Doubles as the `external_reference` of the credit transaction it settles.
    SessionRef
);
string_id!(
    /// An attached consumer of push subscriptions (typically one screen instance).
    ConsumerId
);

impl ConsumerId {
    /// A fresh random consumer id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
