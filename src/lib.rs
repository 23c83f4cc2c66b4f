//! # peerdrop
//!
//! Runs a single PeerDrop device node: loads the TOML config, installs the
//! tracing subscriber and wires the connection manager, transfer engine and
//! pairing coordinator together.

pub mod bootstrap;

pub use bootstrap::{build_node, init_tracing_subscriber, load_config, Node};
