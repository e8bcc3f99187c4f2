//! Message, correlation, and conversation identifiers.
//!
//! Three distinct 128-bit identifiers backed by `uuid::Uuid`. They are kept
//! as separate newtypes so a correlation id can never be passed where a
//! message id is expected. Text form is the hyphenated lowercase UUID.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $err:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses the identifier from its text form.
            ///
            /// # Errors
            ///
            #[doc = concat!("Returns `Error::", stringify!($err), "` if `text` is not a UUID.")]
            pub fn parse(text: &str) -> Result<Self, Error> {
                Uuid::parse_str(text.trim())
                    .map(Self)
                    .map_err(|_| Error::$err(text.to_string()))
            }

            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.hyphenated(), f)
            }
        }
    };
}

define_id!(
    /// Identity of a single message. Unique per envelope.
    MessageId,
    InvalidMessageId
);

define_id!(
    /// Links every message that belongs to the same logical request.
    CorrelationId,
    InvalidCorrelationId
);

define_id!(
    /// Links every message exchanged within one conversation.
    ConversationId,
    InvalidConversationId
);

impl MessageId {
    /// Reinterprets a message id as the correlation id of a new exchange.
    ///
    /// The first message of an exchange conventionally correlates on itself.
    #[must_use]
    pub fn as_correlation(self) -> CorrelationId {
        CorrelationId(self.0)
    }

    /// Reinterprets a message id as the conversation id it starts.
    #[must_use]
    pub fn as_conversation(self) -> ConversationId {
        ConversationId(self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
