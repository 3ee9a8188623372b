use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// An organization (tenant). Every task and row is scoped to one.
    OrgID
);
id_type!(
    /// A contact, the recipient of flows and messages.
    ContactID
);
id_type!(
    /// A contact group.
    GroupID
);
id_type!(
    /// A flow definition in the external flow engine's catalog.
    FlowID
);
id_type!(
    /// A flow start row.
    StartID
);
id_type!(
    /// A human user; system-triggered work has none.
    UserID
);
id_type!(
    /// A schedule row.
    ScheduleID
);
id_type!(
    /// A schedule-bound flow trigger.
    TriggerID
);
id_type!(
    /// A broadcast row.
    BroadcastID
);
id_type!(
    /// A campaign event.
    CampaignEventID
);
id_type!(
    /// One materialized (contact, event, time) campaign event fire.
    FireID
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparent_serialization() {
        let id = OrgID(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: OrgID = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_display() {
        assert_eq!(StartID(7).to_string(), "7");
    }
}
