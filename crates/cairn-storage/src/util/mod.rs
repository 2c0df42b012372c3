//! Small runtime helpers shared by the storage components

mod worker_pool;

pub use worker_pool::WorkerPool;
