//! C1 PTY Executor.

mod executor;

pub use executor::{ByteConsumer, Executor, ExecutorConfig, ExitConsumer, OverflowConsumer, SpawnRequest};
