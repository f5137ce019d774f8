//! Impls - port implementations for development and tests.
//!
//! - **InMemoryResultStore**: records behind one mutex (CAS claim, single-writer batch aggregation)
//! - **InMemoryDeliveryQueue**: delayed, at-least-once notices
//! - **MiniJinjaRenderer**: strict templating with built-in transactional templates
//! - **ScriptedTransport** / **LogTransport**: transports that never touch the network
//!
//! Production adapters (SMTP, a mail API, Redis, Postgres) belong in their own crates.

pub mod inmem_delivery;
pub mod inmem_store;
pub mod log_transport;
pub mod minijinja_renderer;
pub mod scripted_transport;

pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::inmem_store::InMemoryResultStore;
pub use self::log_transport::LogTransport;
pub use self::minijinja_renderer::MiniJinjaRenderer;
pub use self::scripted_transport::ScriptedTransport;
