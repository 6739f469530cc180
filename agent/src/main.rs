//! Command line host for the discovery agent.

use chrono::Local;
use clap::Parser;
use common::{DiscoveryConfig, PeerEvent, Result};
use discovery_agent::DiscoveryAgent;
use env_logger::fmt::Color;
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};

fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder.format(|buf, record| {
        let mut timestamp_style = buf.style();
        let mut level_style = buf.style();
        let mut target_style = buf.style();

        let level_color = match record.level() {
            log::Level::Error => Color::Red,
            log::Level::Warn => Color::Yellow,
            log::Level::Info => Color::Green,
            log::Level::Debug => Color::Cyan,
            log::Level::Trace => Color::White,
        };

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(
            buf,
            "{} {} [{}] {}",
            timestamp_style.set_color(Color::Rgb(100, 100, 100)).value(timestamp),
            level_style.set_color(level_color).value(record.level()),
            target_style.set_color(Color::Blue).value(record.target()),
            record.args()
        )
    });

    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Info);
    }
    builder.init();
}

#[derive(Debug, Clone)]
struct Registration {
    name: String,
    address: SocketAddr,
}

fn parse_registration(raw: &str) -> std::result::Result<Registration, String> {
    let (name, address) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=ip:port, got '{}'", raw))?;
    if name.is_empty() {
        return Err(format!("missing service name in '{}'", raw));
    }
    let address = address
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid address '{}': {}", address, e))?;

    Ok(Registration {
        name: name.to_string(),
        address,
    })
}

#[derive(Parser)]
#[command(name = "discovery-agent", about = "Announce and discover services over IP multicast")]
struct Args {
    /// Services to discover peers for
    #[arg(long, value_delimiter = ',')]
    lookup: Vec<String>,

    /// Service to advertise, as name=ip:port (repeatable)
    #[arg(long = "register", value_parser = parse_registration)]
    register: Vec<Registration>,

    /// Local interface for the multicast join
    #[arg(long)]
    interface: Option<Ipv4Addr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger();
    let args = Args::parse();

    let mut config = DiscoveryConfig::from_env()?;
    if let Some(interface) = args.interface {
        config.interface = Some(interface);
    }
    info!(
        "Using group {}:{}, probing every {:?}",
        config.multicast_addr, config.port, config.lookup_interval
    );

    let agent = DiscoveryAgent::new(config, args.lookup).await?;
    agent.register_callback(PeerEvent::Found, |peer| info!("Peer found: {}", peer));
    agent.register_callback(PeerEvent::Gone, |peer| warn!("Peer gone: {}", peer));
    agent.run()?;

    for registration in &args.register {
        let address = registration.address;
        if let Err(e) = agent
            .register_service(&registration.name, address.ip(), address.port())
            .await
        {
            error!("Failed to register '{}': {}", registration.name, e);
            agent.shutdown().await;
            return Err(e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, retracting services");
    agent.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_parses_name_and_address() {
        let registration = parse_registration("printer=10.0.0.5:9000").unwrap();
        assert_eq!(registration.name, "printer");
        assert_eq!(registration.address, "10.0.0.5:9000".parse().unwrap());
    }

    #[test]
    fn malformed_registrations_are_rejected() {
        assert!(parse_registration("printer").is_err());
        assert!(parse_registration("=10.0.0.5:9000").is_err());
        assert!(parse_registration("printer=10.0.0.5").is_err());
    }

    #[test]
    fn lookup_accepts_comma_separated_services() {
        let args = Args::parse_from([
            "discovery-agent",
            "--lookup",
            "printer,scanner",
            "--register",
            "fax=10.0.0.7:7000",
        ]);
        assert_eq!(args.lookup, vec!["printer", "scanner"]);
        assert_eq!(args.register.len(), 1);
        assert_eq!(args.register[0].name, "fax");
        assert!(args.interface.is_none());
    }
}
