#![deny(unsafe_op_in_unsafe_fn)]
#![doc = include_str!("../README.md")]

mod error;
mod hash;
mod map;
mod raw;

pub use error::{Error, Result};
pub use hash::mix;
pub use map::{default_concurrency_level, AddrCache, AddrCacheBuilder};
