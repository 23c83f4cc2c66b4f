pub mod config;
pub mod identity;
pub mod tracing;
pub mod wiring;

pub use config::{default_config_path, load_config, load_config_or_default};
pub use identity::{resolve_device, resolve_paths, NodePaths};
pub use self::tracing::init_tracing_subscriber;
pub use wiring::{build_node, build_node_with, log_events, Node};
