pub mod lifecycle;
pub mod models;

pub use lifecycle::{
    create_start, load_start, resolve_and_dispatch, MAX_ANCESTORS_SINCE_INPUT,
};
pub use models::{chunk_contacts, FlowStart, FlowStartBatch, START_BATCH_SIZE};
