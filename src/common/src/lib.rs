//! Types shared between the kport portability layer and kernel backends.

#![no_std]
#![warn(missing_docs)]

pub mod caps;
pub mod error;
pub mod time;

pub use caps::KernelCaps;
pub use error::{OsError, Result};
pub use time::{SysTime, Timeout, Wait, INFINITE_DELAY, MAX_DELAY};
