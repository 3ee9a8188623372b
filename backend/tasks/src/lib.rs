pub mod broadcasts;
pub mod context;
pub mod registry;
pub mod starts;

#[cfg(test)]
mod testutil;

pub use broadcasts::{BroadcastBatch, SendBroadcastBatchTask, SendBroadcastTask};
pub use context::TaskContext;
pub use registry::{default_registry, QueueTask, TaskRegistry};
pub use starts::{StartFlowBatchTask, StartFlowTask, StartIvrFlowBatchTask};
