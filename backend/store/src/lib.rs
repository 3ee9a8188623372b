pub mod campaigns;
pub mod locks;
pub mod schedules;
pub mod starts;
pub mod store;

pub use campaigns::{EventFire, FireGroup};
pub use schedules::{Broadcast, Schedule, ScheduleTrigger, BROADCAST_QUEUED, BROADCAST_SENT};
pub use starts::{FlowRow, StartStatusInfo};
pub use store::Store;
