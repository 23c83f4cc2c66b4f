mod memory;
mod websocket;

pub use memory::{MemorySignaling, MemorySignalingHub};
pub use websocket::WebSocketSignaling;
