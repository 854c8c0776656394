//! Shared helpers for the integration suite

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use takt_core::connection::ModuleConnection;
use takt_core::messages::{data_type, ModuleStateMessage, Pulse, PulseAck};
use takt_core::{
    ConferenceFactory, Envelope, LocalHub, ManagedLevel, ModuleDescriptor, SchedulerEvent,
    ServerInformation, Supercomponent, SupercomponentConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

/// Supercomponent on 127.0.0.1 with ephemeral ports and an in-process bus.
pub async fn start(
    level: ManagedLevel,
    frequency: u32,
    tweak: impl FnOnce(SupercomponentConfig) -> SupercomponentConfig,
) -> (Supercomponent, LocalHub, mpsc::UnboundedReceiver<SchedulerEvent>) {
    let hub = LocalHub::new();
    let config = SupercomponentConfig::default()
        .with_managed_level(level)
        .with_frequency(f64::from(frequency))
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port(0)
        .with_discovery_port(0);
    let (tx, rx) = mpsc::unbounded_channel();

    let sc = Supercomponent::start(tweak(config), ConferenceFactory::Local(hub.clone()), Some(tx))
        .await
        .unwrap();
    (sc, hub, rx)
}

pub fn server_info(sc: &Supercomponent) -> ServerInformation {
    ServerInformation::new(
        "127.0.0.1",
        sc.connection_addr().port(),
        sc.server_information().managed_level,
    )
}

/// Connect a raw module session and wait until the registry has it.
pub async fn connect(sc: &Supercomponent, name: &str) -> ModuleConnection {
    let md = ModuleDescriptor::new(name);
    let (conn, _config) = ModuleConnection::connect(&server_info(sc), &md, WAIT)
        .await
        .unwrap();

    timeout(WAIT, async {
        while !sc.registry().contains(&md) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("module registered");
    conn
}

/// Answer every pulse with one envelope carrying the module's name.
/// Resolves to true once NOT_RUNNING arrived.
pub fn spawn_acking(mut conn: ModuleConnection) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let name = conn.descriptor().name.clone();
        while let Some(env) = conn.recv().await {
            match env.data_type() {
                data_type::PULSE => {
                    let Ok(pulse) = env.decode::<Pulse>() else { continue };
                    let ack = PulseAck {
                        tick: pulse.tick,
                        envelopes: vec![Envelope::wrap(data_type::USER, name.as_bytes().to_vec())],
                    };
                    if conn.send(Envelope::from_payload(&ack)).await.is_err() {
                        return false;
                    }
                }
                data_type::MODULE_STATE => {
                    return env.decode::<ModuleStateMessage>().is_ok();
                }
                _ => {}
            }
        }
        false
    })
}

/// Collect events until `done` returns true for one of them.
pub async fn collect_until(
    events: &mut mpsc::UnboundedReceiver<SchedulerEvent>,
    mut done: impl FnMut(&SchedulerEvent) -> bool,
) -> Vec<SchedulerEvent> {
    let mut seen = Vec::new();
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await
    .expect("expected scheduler event");
    seen
}
