use std::sync::Arc;

use flowline_core::{ContactResolver, FlowEngine, MessageSender};
use flowline_queue::Queue;
use flowline_store::Store;

/// Everything a task executor needs, passed explicitly at construction.
/// There is no process-global state; two contexts against different stores
/// are fully independent.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Store,
    pub queue: Queue,
    pub resolver: Arc<dyn ContactResolver>,
    pub engine: Arc<dyn FlowEngine>,
    pub sender: Arc<dyn MessageSender>,
}
