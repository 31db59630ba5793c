// Output streaming: truncating message buffers and the periodic publisher

mod buffer;
mod publisher;

pub use buffer::{MessageBuffer, MessageText, MAX_MESSAGE_LENGTH};
pub use publisher::{
    OutputWriter, PeriodicPublisher, PublishSchedule, SnapshotSink, SnapshotWriter,
};
