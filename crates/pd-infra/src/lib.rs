//! Adapters for the PeerDrop core ports: the JSON paired-device store, the
//! received-content sinks and the system clock.

pub mod pairing;
pub mod time;
pub mod transfer;

pub use pairing::JsonFilePairedDeviceRepository;
pub use time::SystemClock;
pub use transfer::{ChannelSink, FileDownloadSink};
