//! Pairing: trust establishment between devices and pairing codes.

mod auth_code_service;
mod coordinator;

pub use auth_code_service::AuthCodeService;
pub use coordinator::{PairingConfig, PairingCoordinator, PairingPorts};
