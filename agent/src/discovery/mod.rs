mod agent;
pub mod codec;
mod registry;
mod transport;

use common::{DiscoveryConfig, Result};

pub use agent::DiscoveryAgent;
pub use registry::{PeerRegistry, Upsert};
pub use transport::{receive_loop, resolve_interface, Channel, InboundHandler, Transport};

/// Builds an agent for `lookup` and starts its loops on the current runtime.
pub async fn start_discovery<I, S>(config: DiscoveryConfig, lookup: I) -> Result<DiscoveryAgent>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let agent = DiscoveryAgent::new(config, lookup).await?;
    agent.run()?;
    Ok(agent)
}
