mod memory;
mod tcp;

pub use memory::MemoryLinkFactory;
pub use tcp::TcpLinkFactory;
