//! Entry points of the host binary

mod replay;
mod server;

pub use replay::{replay, ReplayOptions};
pub use server::serve;
