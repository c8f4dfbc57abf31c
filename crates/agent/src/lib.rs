//! Task lifecycle management.
//!
//! The agent owns the task registry and serializes every mutation through
//! a single control loop: start and stop commands from the message bus,
//! stop requests from operators, and reap notifications from exiting task
//! processes all funnel into one channel, so registry transitions never
//! race each other.

pub mod advertiser;
pub mod agent;
pub mod control;
pub mod registry;
pub mod snapshot;
pub mod task;

pub use advertiser::Advertiser;
pub use agent::{Agent, AgentHandle};
pub use control::subscribe_control;
pub use registry::Registry;
pub use task::{Attached, Task};
