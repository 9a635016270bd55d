// Output module for pf

pub mod errors;
pub mod multiplex;
pub mod terminal;

pub use errors::*;
pub use multiplex::{HostSink, LineBuffer, MarkerKind, OutputMultiplexer, Stream};
pub use terminal::*;
