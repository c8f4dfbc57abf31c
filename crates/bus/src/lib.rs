//! Message bus implementations.
//!
//! Production traffic rides Redis pub/sub; tests use the in-memory bus
//! from `sandgate_core::mocks`.

pub mod redis;

pub use crate::redis::RedisMessageBus;
