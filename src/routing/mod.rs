//! Routing - agent registry, priority queue and retry scheduling.
//!
//! All three hold plain in-memory state and take `&mut self` for mutation;
//! callers that share an instance wrap it in a lock.

pub mod queue;
pub mod registry;
pub mod retry;

pub use queue::{MessageQueue, QueueEntry, QueueStats};
pub use registry::{
    AgentInfo, AgentRegistry, Descriptor, DescriptorExtractor, HeuristicExtractor, RegistryStats,
};
pub use retry::{RetryHandler, RetryMetadata, RetrySchedule, RetryStats};
