pub mod error;
pub mod ids;
pub mod task;
pub mod traits;
pub mod types;

pub use error::FlowlineError;
pub use ids::{
    BroadcastID, CampaignEventID, ContactID, FireID, FlowID, GroupID, OrgID, ScheduleID, StartID,
    TriggerID, UserID,
};
pub use task::{Priority, Task, BATCH_QUEUE};
pub use traits::{ContactResolver, FlowEngine, MessageSender, RunOutcome, UrnResolution};
pub use types::{
    read_session_history, Exclusions, FlowType, RepeatPeriod, SessionHistory, StartStatus,
    StartType,
};
