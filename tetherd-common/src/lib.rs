#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod channel;
pub use channel::{channel, Channel};
