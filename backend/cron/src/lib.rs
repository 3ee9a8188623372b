pub mod campaigns;
pub mod driver;
pub mod schedules;

pub use campaigns::{fire_campaign_events, CAMPAIGNS_LOCK};
pub use driver::run_cron;
pub use schedules::{check_schedules, SCHEDULES_LOCK};
