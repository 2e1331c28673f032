//! Embedded MQTT broker that module runtimes publish their operation events to.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, bail};
use rumqttd::{Broker, Config};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::ports::allocate_port;
use crate::config::ModuleEventsConfig;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_POLL: Duration = Duration::from_millis(20);
const MAX_CONNECTIONS: usize = 10_010;
const MAX_INFLIGHT: usize = 100;
const CONNECTION_TIMEOUT_MS: u16 = 60_000;

/// Handle of the running broker.
///
/// The broker threads run until the process exits.
pub struct EmbeddedBroker {
    addr: SocketAddr,
    _thread: JoinHandle<()>,
}

impl EmbeddedBroker {
    /// Starts the broker on `mqtt_host:mqtt_port`, or on a free port when the port is 0,
    /// and waits until it accepts connections.
    ///
    /// # Errors
    /// Fails when the address cannot be resolved or bound, or the broker does not accept
    /// connections within five seconds.
    pub async fn start(cfg: &ModuleEventsConfig) -> anyhow::Result<Self> {
        let port = match cfg.mqtt_port {
            0 => allocate_port()?,
            port => port,
        };
        let addrs: Vec<SocketAddr> = (cfg.mqtt_host.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve MQTT broker address {}:{port}", cfg.mqtt_host))?
            .collect();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .with_context(|| format!("MQTT broker address {}:{port} resolves to nothing", cfg.mqtt_host))?;
        // surface an occupied port here instead of inside the broker threads
        drop(TcpListener::bind(addr).with_context(|| format!("MQTT broker port {addr} is not available"))?);

        let config = broker_config(addr, cfg.max_message_size)?;
        let thread = std::thread::Builder::new()
            .name("mqtt-broker".to_owned())
            .spawn(move || {
                let mut broker = Broker::new(config);
                if let Err(e) = broker.start() {
                    tracing::error!(error = %e, "embedded MQTT broker stopped");
                }
            })
            .context("failed to spawn MQTT broker thread")?;

        wait_until_listening(addr).await?;
        tracing::info!(%addr, "embedded MQTT broker started");
        Ok(Self {
            addr,
            _thread: thread,
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

fn broker_config(addr: SocketAddr, max_payload_size: usize) -> anyhow::Result<Config> {
    serde_json::from_value(json!({
        "id": 0,
        "router": {
            "max_connections": MAX_CONNECTIONS,
            "max_outgoing_packet_count": 200,
            "max_segment_size": 104_857_600,
            "max_segment_count": 10
        },
        "v4": {
            "1": {
                "name": "v4-1",
                "listen": addr.to_string(),
                "next_connection_delay_ms": 1,
                "connections": {
                    "connection_timeout_ms": CONNECTION_TIMEOUT_MS,
                    "max_payload_size": max_payload_size,
                    "max_inflight_count": MAX_INFLIGHT,
                    "dynamic_filters": true
                }
            }
        }
    }))
    .context("invalid MQTT broker configuration")
}

async fn wait_until_listening(addr: SocketAddr) -> anyhow::Result<()> {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "MQTT broker on {addr} did not accept connections within {}",
                humantime::format_duration(STARTUP_TIMEOUT)
            );
        }
        tokio::time::sleep(STARTUP_POLL).await;
    }
}
