pub mod discovery;

pub use discovery::{codec, start_discovery, DiscoveryAgent, PeerRegistry};
