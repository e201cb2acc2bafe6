#![doc = include_str!("../README.md")]

mod error;
mod limiter;
mod store;
mod stream;
mod time;

pub use crate::error::*;
pub use crate::limiter::*;
pub use crate::store::*;
pub use crate::stream::*;
pub use crate::time::*;
