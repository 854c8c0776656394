//! takt demo module
//!
//! Publishes an incrementing counter on every step and logs what arrives on
//! the conference.

use clap::Parser;
use std::time::Duration;
use takt_core::codec::{field_id, Decodable, Decoder, Encodable, Encoder, FieldId};
use takt_core::discovery::DiscoveryConfig;
use takt_core::error::CodecError;
use takt_core::messages::data_type;
use takt_core::scheduler::parse_frequency;
use takt_core::{
    DataType, Envelope, ExitCode, ModuleOptions, ModuleRuntime, Payload, StepContext, StepError,
    TaktError, TimeTriggered,
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// takt demo module
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Module name
    #[arg(short, long, default_value = "counter")]
    name: String,

    /// Instance id
    #[arg(long)]
    id: Option<u32>,

    /// Conference id (2..=254)
    #[arg(long, default_value = "111")]
    cid: u8,

    /// Own frequency in Hz
    #[arg(long, value_parser = parse_frequency, default_value = "1")]
    freq: f64,

    /// Discovery attempts before giving up
    #[arg(long, default_value = "5")]
    attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Counter value published by this module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counter {
    value: u32,
}

const F_VALUE: FieldId = field_id("value");

impl Encodable for Counter {
    fn encode(&self, enc: &mut Encoder) {
        enc.put(F_VALUE, &self.value);
    }
}

impl Decodable for Counter {
    fn decode(dec: &Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            value: dec.get(F_VALUE)?,
        })
    }
}

impl Payload for Counter {
    const DATA_TYPE: DataType = data_type::USER;
}

struct CounterModule {
    counter: u32,
}

impl TimeTriggered for CounterModule {
    fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        for envelope in ctx.received() {
            match envelope.decode::<Counter>() {
                Ok(counter) => info!(
                    "counter {} (sent {}, received {})",
                    counter.value,
                    envelope.sent(),
                    envelope.received()
                ),
                Err(_) => debug!("envelope of type {}", envelope.data_type()),
            }
        }

        self.counter += 1;
        if let Some(pulse) = ctx.pulse() {
            debug!("step {} on tick {}", self.counter, pulse.tick);
        }
        ctx.publish(Envelope::from_payload(&Counter {
            value: self.counter,
        }));
        Ok(())
    }
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

    let mut options = ModuleOptions::new(args.name)
        .with_cid(args.cid)
        .with_frequency(args.freq)
        .with_discovery(
            DiscoveryConfig::default()
                .with_attempts(args.attempts)
                .with_attempt_timeout(Duration::from_secs(1)),
        );
    if let Some(id) = args.id {
        options = options.with_instance(id);
    }

    let mut runtime = ModuleRuntime::new(options);
    if let Err(e) = runtime.setup().await {
        error!("Setup of {} failed: {}", runtime.descriptor(), e);
        let code = match e {
            TaktError::Discovery(_) | TaktError::Connection(_) => ExitCode::NoSupercomponent,
            _ => ExitCode::SeriousError,
        };
        std::process::exit(code.status());
    }

    let stop = runtime.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let code = runtime.run(&mut CounterModule { counter: 0 }).await;
    std::process::exit(code.status());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_and_fractional_frequency() {
        let args = Args::try_parse_from(["takt-module", "--freq=2.5", "--id=3"]).unwrap();
        assert_eq!(args.freq, 2.5);
        assert_eq!(args.id, Some(3));
        assert_eq!(args.cid, 111);
        assert!(Args::try_parse_from(["takt-module", "--freq=0"]).is_err());
    }
}
