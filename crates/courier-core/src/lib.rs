//! courier-core
//!
//! Job lifecycle engine for background notification delivery.
//!
//! # Modules
//! - **domain**: ids, job records and their state machine, errors, retry and admission policies
//! - **ports**: traits at the seams (ResultStore, DeliveryQueue, Transport, Renderer, Clock, IdGenerator)
//! - **impls**: in-memory store and queue, MiniJinja renderer, development transports
//! - **app**: dispatcher, batch orchestrator, delivery worker, worker pool, reaper and GC loops
//! - **config**: `COURIER_*` environment configuration
//! - **observability**: per-state record counts

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{Dispatcher, DispatcherBuilder, WorkerPool};
pub use config::{ConfigError, CourierConfig};
pub use error::CourierError;
pub use observability::StateCounts;
