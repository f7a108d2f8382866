pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod ice;
pub mod identity;
pub mod logging;
pub mod nat;
pub mod network;
pub mod racer;
pub mod rtc;
pub mod session;
pub mod signaling;

pub use config::PeerConfig;
pub use error::PeerError;
pub use events::PeerEvent;
pub use identity::{PeerId, PeerProfile};
pub use network::{InitiateOptions, PeerNetwork, TransferDescription};
