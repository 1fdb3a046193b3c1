//! The three services layered on top of the Raft engine: a
//! distributed lock manager, a sharded persistent queue, and an
//! MESI-style cache. Each owns its own state and wire handlers; `Node`
//! wires them to the transport and to the Raft commit stream.

pub mod cache;
pub mod lock;
pub mod queue;

pub use cache::CacheManager;
pub use lock::LockManager;
pub use queue::QueueManager;
