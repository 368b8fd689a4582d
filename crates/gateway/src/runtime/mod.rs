//! Long-lived runtime components: the operations pipeline, the sync
//! scheduler and engine, the event bus, and cancellation plumbing.

pub mod backoff;
pub mod cancel;
pub mod events;
pub mod handlers;
pub mod pipeline;
pub mod scheduler;
pub mod sync_engine;

pub use cancel::CancelMap;
pub use events::{EventBus, Subscription};
pub use pipeline::Pipeline;
pub use scheduler::SyncScheduler;
pub use sync_engine::{SyncEngine, UpstreamVaultGateway};
