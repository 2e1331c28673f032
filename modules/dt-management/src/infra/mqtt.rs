//! MQTT subscription feeding the [`EventForwarder`].

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::forwarder::{EventForwarder, MODULE_TOPIC_FILTER};
use crate::config::ModuleEventsConfig;

const CLIENT_ID: &str = "dt-management";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

/// Spawns the listener loop; it resubscribes after every (re)connect and stops on cancel.
pub fn spawn_module_listener(
    cfg: &ModuleEventsConfig,
    forwarder: Arc<EventForwarder>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut options = MqttOptions::new(CLIENT_ID, cfg.mqtt_host.clone(), cfg.mqtt_port);
    options.set_keep_alive(KEEP_ALIVE);
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let host = cfg.mqtt_host.clone();
    let port = cfg.mqtt_port;

    tokio::spawn(async move {
        tracing::info!(host = %host, port, filter = MODULE_TOPIC_FILTER, "module event listener started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(e) = client.subscribe(MODULE_TOPIC_FILTER, QoS::AtLeastOnce).await {
                            tracing::warn!(error = %e, "failed to subscribe to module events");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        forwarder.on_publish(publish.topic, publish.payload.to_vec());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(host = %host, port, error = %e, "module event bus connection error");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
            }
        }
        if let Err(e) = client.disconnect().await {
            tracing::debug!(error = %e, "mqtt disconnect failed");
        }
        tracing::info!("module event listener stopped");
    })
}
