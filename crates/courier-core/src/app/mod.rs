//! App - application layer wiring ports into the job lifecycle.
//!
//! - **DispatcherBuilder**: wiring with fail-fast validation
//! - **Dispatcher**: enqueue API and status query
//! - **BatchOrchestrator**: batch fan-out with staggered admission
//! - **DeliveryWorker**: claim -> render -> deliver -> decide -> complete
//! - **WorkerPool**: N workers and a reaper under one shutdown signal
//! - **ReaperLoop**: lease expiry and re-announcement of stranded records
//! - **GcLoop**: retention purge

pub mod builder;
pub mod dispatcher;
pub mod gc_loop;
pub mod orchestrator;
pub mod pool;
pub mod reaper_loop;
pub mod worker;

pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::dispatcher::Dispatcher;
pub use self::gc_loop::GcLoop;
pub use self::orchestrator::BatchOrchestrator;
pub use self::pool::WorkerPool;
pub use self::reaper_loop::ReaperLoop;
pub use self::worker::{DeliverySettings, DeliveryWorker, Processed};
