mod chunker;
mod pipeline;
mod streamer;

pub use chunker::*;
pub use pipeline::*;
pub use streamer::*;
