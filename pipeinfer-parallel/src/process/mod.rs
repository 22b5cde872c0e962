//! Process-isolated execution: wire protocol, worker side and pool

mod executor;
mod pool;
pub mod protocol;
pub mod worker;

pub(crate) use executor::ProcessBatches;
pub use executor::ProcessExecutor;
pub use pool::ProcessPool;
pub use worker::{is_worker_process, run_worker, serve, TaskRegistry};
