#![doc = include_str!("../README.md")]

mod error;
mod store;

pub use error::Error;
pub use store::{RedisStore, RedisStoreBuilder};
