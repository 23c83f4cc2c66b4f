mod channel_sink;
mod file_sink;

pub use channel_sink::ChannelSink;
pub use file_sink::{sanitize_file_name, FileDownloadSink};
