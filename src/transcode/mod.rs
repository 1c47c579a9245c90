// Supervised transcoding engine
//
// One Transcoder drives one external encoder process at a time:
// - spec/command: declarative input/output description and argument building
// - runner: lifecycle controller (run, stop, done, exit, reset)
// - parser/events: status-channel grammar and the typed event bus
// - watchdog: stall detection over the progress stream
// - sink: fan-out of the piped media channel

pub mod command;
pub mod events;
pub mod parser;
pub mod runner;
pub mod sink;
pub mod spec;
pub mod watchdog;

pub use events::*;
pub use parser::{FinalSizes, HeaderInfo, ProgressSample};
pub use runner::*;
pub use sink::SinkWriter;
pub use spec::{InputSource, InputSpec, OutputSpec, OutputTarget};
