pub mod hunks;
pub mod offsets;
pub mod writer;

pub use hunks::{apply_hunks, compute_hunks};
pub use writer::{forward_events, LineWriter, StreamWriter};
