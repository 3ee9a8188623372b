use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// How a flow start was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartType {
    #[serde(rename = "M")]
    Manual,
    #[serde(rename = "A")]
    Api,
    /// Fired by a schedule-bound trigger.
    #[serde(rename = "T")]
    Trigger,
    /// Fired by a campaign event.
    #[serde(rename = "C")]
    Campaign,
}

impl StartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartType::Manual => "M",
            StartType::Api => "A",
            StartType::Trigger => "T",
            StartType::Campaign => "C",
        }
    }
}

/// The category of the flow being started, which decides the batch task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowType {
    #[serde(rename = "M")]
    Messaging,
    #[serde(rename = "V")]
    Voice,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Messaging => "M",
            FlowType::Voice => "V",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "M" => Some(FlowType::Messaging),
            "V" => Some(FlowType::Voice),
            _ => None,
        }
    }
}

/// Status of a flow start. Transitions are one-directional:
/// `P -> S -> C`, with `F` reachable from `P` and `S`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartStatus {
    #[serde(rename = "P")]
    Pending,
    #[serde(rename = "S")]
    Starting,
    #[serde(rename = "C")]
    Complete,
    #[serde(rename = "F")]
    Failed,
}

impl StartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartStatus::Pending => "P",
            StartStatus::Starting => "S",
            StartStatus::Complete => "C",
            StartStatus::Failed => "F",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P" => Some(StartStatus::Pending),
            "S" => Some(StartStatus::Starting),
            "C" => Some(StartStatus::Complete),
            "F" => Some(StartStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StartStatus::Complete | StartStatus::Failed)
    }
}

/// How often a schedule repeats after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatPeriod {
    #[serde(rename = "O")]
    Never,
    #[serde(rename = "D")]
    Daily,
    #[serde(rename = "W")]
    Weekly,
    #[serde(rename = "M")]
    Monthly,
}

impl RepeatPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatPeriod::Never => "O",
            RepeatPeriod::Daily => "D",
            RepeatPeriod::Weekly => "W",
            RepeatPeriod::Monthly => "M",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "O" => Some(RepeatPeriod::Never),
            "D" => Some(RepeatPeriod::Daily),
            "W" => Some(RepeatPeriod::Weekly),
            "M" => Some(RepeatPeriod::Monthly),
            _ => None,
        }
    }

    /// The next fire time after processing a fire scheduled at `from`, or
    /// None for one-shot schedules. Missed periods are skipped: the result is
    /// always strictly after `now`.
    pub fn advance(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut next = from;
        loop {
            next = match self {
                RepeatPeriod::Never => return None,
                RepeatPeriod::Daily => next + Duration::days(1),
                RepeatPeriod::Weekly => next + Duration::days(7),
                RepeatPeriod::Monthly => next.checked_add_months(Months::new(1))?,
            };
            if next > now {
                return Some(next);
            }
        }
    }
}

/// Contact predicates excluded from a start's recipient set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusions {
    /// Exclude contacts who have been in this flow before.
    #[serde(default)]
    pub started_previously: bool,
    /// Exclude contacts currently waiting in any flow.
    #[serde(default)]
    pub in_a_flow: bool,
    /// Exclude contacts not seen in this many days (0 = off).
    #[serde(default)]
    pub not_seen_since_days: i64,
    /// Exclude blocked, stopped and archived contacts.
    #[serde(default)]
    pub non_active: bool,
}

impl Exclusions {
    pub fn is_empty(&self) -> bool {
        !self.started_previously
            && !self.in_a_flow
            && self.not_seen_since_days == 0
            && !self.non_active
    }
}

/// Decoded ancestry of a session that triggered a start from inside another
/// flow. Used to cap recursive flow-triggering depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHistory {
    #[serde(default)]
    pub parent_uuid: String,
    #[serde(default)]
    pub ancestors: u32,
    #[serde(default)]
    pub ancestors_since_input: u32,
}

/// Parse the opaque `session_history` payload carried on a start. Malformed
/// input is a hard decode error, never a silent default.
pub fn read_session_history(raw: &str) -> Result<SessionHistory, serde_json::Error> {
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [
            StartStatus::Pending,
            StartStatus::Starting,
            StartStatus::Complete,
            StartStatus::Failed,
        ] {
            assert_eq!(StartStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StartStatus::parse("X"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(StartStatus::Complete.is_terminal());
        assert!(StartStatus::Failed.is_terminal());
        assert!(!StartStatus::Pending.is_terminal());
        assert!(!StartStatus::Starting.is_terminal());
    }

    #[test]
    fn test_advance_one_shot_clears() {
        let now = Utc::now();
        assert_eq!(RepeatPeriod::Never.advance(now, now), None);
    }

    #[test]
    fn test_advance_skips_missed_periods() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let missed = now - Duration::days(3);
        let next = RepeatPeriod::Daily.advance(missed, now).unwrap();
        assert!(next > now);
        assert_eq!(next, now + Duration::days(1));
    }

    #[test]
    fn test_advance_monthly() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap();
        let next = RepeatPeriod::Monthly.advance(now, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_exclusions_empty() {
        assert!(Exclusions::default().is_empty());
        assert!(!Exclusions { in_a_flow: true, ..Default::default() }.is_empty());
        assert!(!Exclusions { not_seen_since_days: 90, ..Default::default() }.is_empty());
    }

    #[test]
    fn test_read_session_history() {
        let history = read_session_history(
            r#"{"parent_uuid": "532a3899-492f-4ffe-aed7-e75ad524efab", "ancestors": 3, "ancestors_since_input": 1}"#,
        )
        .unwrap();
        assert_eq!(history.parent_uuid, "532a3899-492f-4ffe-aed7-e75ad524efab");
        assert_eq!(history.ancestors, 3);
        assert_eq!(history.ancestors_since_input, 1);
    }

    #[test]
    fn test_read_session_history_truncated_is_error() {
        assert!(read_session_history("{").is_err());
    }
}
