//! Background processing: a pool of OS threads running the pipeline and a
//! poller that claims work from the store.

pub mod job;
pub mod poller;
pub mod pool;

pub use job::{IngestJob, JobKind, JobResult};
pub use poller::Poller;
pub use pool::WorkerPool;
