//! Typed identifiers for persisted rows.
//!
//! Every entity in the store is addressed by a newtype wrapping a [`Uuid`],
//! serialized as its string form. Using one newtype per entity kind (rather
//! than passing raw `String`s or a single shared `Id` type) means a
//! `LeadId` can never be silently accepted where a `ConversationId` is
//! expected — the kind of mixup that is easy to make once dozens of
//! functions take `(lead_id, conversation_id, campaign_id)` tuples.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

typed_id!(LeadId);
typed_id!(ConversationId);
typed_id!(MessageId);
typed_id!(CampaignId);
typed_id!(TemplateId);
typed_id!(AgentId);
typed_id!(CommunicationId);
typed_id!(HandoverId);
typed_id!(DecisionId);
typed_id!(DeadLetterId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_ids_round_trip_through_strings() {
        let id = LeadId::new();
        let s = id.to_string();
        let parsed: LeadId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn distinct_newtypes_do_not_compare() {
        // This is enforced at the type level — LeadId and ConversationId are
        // different types, so `LeadId::new() == ConversationId::new()` would
        // not compile. Here we just check that two freshly minted ids differ.
        assert_ne!(LeadId::new(), LeadId::new());
    }
}
