//! Ports - traits at the seams with the outside world.
//!
//! - **ResultStore**: source of truth for job records (atomic claim/complete)
//! - **DeliveryQueue**: at-least-once notices carrying job ids
//! - **Transport** / **Renderer**: external collaborators, injected
//! - **Clock** / **IdGenerator**: time and ids, swappable in tests

pub mod clock;
pub mod delivery_queue;
pub mod id_generator;
pub mod renderer;
pub mod result_store;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::{DeliveryQueue, JobNotice, QueueError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::renderer::Renderer;
pub use self::result_store::{
    ClaimOutcome, Completed, Completion, ReapPolicy, Reaped, ResultStore, StoreError,
};
pub use self::transport::Transport;
