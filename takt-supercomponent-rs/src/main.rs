//! takt supercomponent
//!
//! Answers discovery, serves module configuration and drives the managed
//! level for every connected module.

use clap::Parser;
use std::path::PathBuf;
use takt_core::config::Configuration;
use takt_core::scheduler::parse_frequency;
use takt_core::{ConferenceFactory, ManagedLevel, Supercomponent, SupercomponentConfig};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// takt supercomponent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Conference id (2..=254)
    #[arg(long, default_value = "111")]
    cid: u8,

    /// Scheduler frequency in Hz
    #[arg(long, value_parser = parse_frequency, default_value = "10")]
    freq: f64,

    /// Managed level (none, pulse, pulse_shift, pulse_time_ack)
    #[arg(long, default_value = "none")]
    managed: ManagedLevel,

    /// Configuration file served to modules
    #[arg(long, default_value = "./configuration")]
    configuration: PathBuf,

    /// TCP port for module connections
    #[arg(long, default_value = "19866")]
    port: u16,

    /// UDP port for discovery
    #[arg(long, default_value = "19751")]
    discovery_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store = match Configuration::load(&args.configuration) {
        Ok(store) => {
            info!(
                "Loaded {} configuration entries from {}",
                store.len(),
                args.configuration.display()
            );
            store
        }
        Err(e) => {
            warn!(
                "No configuration from {} ({}), serving an empty one",
                args.configuration.display(),
                e
            );
            Configuration::new()
        }
    };

    let config = SupercomponentConfig::from_configuration(store)?
        .with_cid(args.cid)
        .with_frequency(args.freq)
        .with_managed_level(args.managed)
        .with_port(args.port)
        .with_discovery_port(args.discovery_port);

    let supercomponent = Supercomponent::start(config, ConferenceFactory::Multicast, None).await?;

    tokio::signal::ctrl_c().await?;
    info!(
        "Interrupted with {} module(s) connected",
        supercomponent.registry().len()
    );
    supercomponent.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fractional_frequency_accepted() {
        let args = Args::try_parse_from(["takt-supercomponent", "--freq=0.5", "--managed=pulse_time_ack"]).unwrap();
        assert_eq!(args.freq, 0.5);
        assert_eq!(args.managed, ManagedLevel::PulseTimeAck);
    }

    #[test]
    fn test_non_positive_frequency_rejected() {
        assert!(Args::try_parse_from(["takt-supercomponent", "--freq=0"]).is_err());
        assert!(Args::try_parse_from(["takt-supercomponent", "--freq=-1"]).is_err());
    }
}
