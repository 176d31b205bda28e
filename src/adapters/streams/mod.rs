//! Stream store implementations backing the stream-log adapter.

mod in_memory;
mod redis;

pub use in_memory::InMemoryStreamStore;
pub use self::redis::RedisStreamStore;
