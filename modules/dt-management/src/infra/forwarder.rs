//! Inbound relay of operation events emitted by running modules.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::bridge::EventBridge;
use super::relay::{BoundedRelay, RelayHandler};
use crate::config::ModuleEventsConfig;
use crate::domain::aas::{Key, Reference};
use crate::domain::events::{DomainEvent, EventPayload, ServiceInvocation};
use crate::domain::model::Module;

/// Subscription filter covering every module topic.
pub const MODULE_TOPIC_FILTER: &str = "module/+/#";

const DRAIN_GRACE: Duration = Duration::from_secs(2);

static TOPIC_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^module/([^/]+)/Operation(Invoke|Finish)EventMessage$"));

/// Topic prefix a module's runtime publishes under.
#[must_use]
pub fn module_topic_prefix(module_id: &str) -> String {
    format!("module/{module_id}/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationEventKind {
    Invoke,
    Finish,
}

fn parse_topic(topic: &str) -> Option<(String, OperationEventKind)> {
    let pattern = TOPIC_PATTERN.as_ref().ok()?;
    let caps = pattern.captures(topic)?;
    let kind = match caps.get(2)?.as_str() {
        "Invoke" => OperationEventKind::Invoke,
        _ => OperationEventKind::Finish,
    };
    Some((caps.get(1)?.as_str().to_owned(), kind))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationEventMessage {
    element: Reference,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    input: Map<String, Value>,
    #[serde(default)]
    output: Option<Map<String, Value>>,
    #[serde(default)]
    success: Option<bool>,
}

#[derive(Debug, Clone)]
struct ServiceRoute {
    keys: Vec<Key>,
    service_id: String,
    service_catalog_id: Option<String>,
    name: String,
    endpoint: Option<String>,
}

type Routes = DashMap<String, Vec<ServiceRoute>>;

/// Raw message as received from the module bus.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

struct ForwardHandler {
    routes: Arc<Routes>,
    bridge: Arc<EventBridge>,
}

impl ForwardHandler {
    fn translate(&self, message: &InboundMessage) -> Option<DomainEvent> {
        let Some((module_id, kind)) = parse_topic(&message.topic) else {
            tracing::trace!(topic = %message.topic, "ignoring module message");
            return None;
        };
        let parsed: OperationEventMessage = match serde_json::from_slice(&message.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "malformed operation event");
                return None;
            }
        };
        let routes = self.routes.get(&module_id)?;
        let Some(route) = routes.iter().find(|r| r.keys == parsed.element.keys) else {
            tracing::debug!(module_id = %module_id, element = %parsed.element, "operation event for unknown service");
            return None;
        };

        let invocation = ServiceInvocation {
            service_id: route.service_id.clone(),
            service_catalog_id: route.service_catalog_id.clone(),
            name: route.name.clone(),
            endpoint: route.endpoint.clone(),
            invocation_id: parsed.invocation_id,
            input_arguments: parsed.input,
            output_arguments: None,
            success: None,
        };
        let payload = match kind {
            OperationEventKind::Invoke => EventPayload::ServiceInvoked(invocation),
            OperationEventKind::Finish => EventPayload::ServiceFinished(ServiceInvocation {
                output_arguments: Some(parsed.output.unwrap_or_default()),
                success: Some(parsed.success.unwrap_or(false)),
                ..invocation
            }),
        };
        Some(DomainEvent::new(module_id, payload))
    }
}

#[async_trait]
impl RelayHandler<InboundMessage> for ForwardHandler {
    async fn handle(&self, message: InboundMessage) {
        if let Some(event) = self.translate(&message) {
            self.bridge.publish(event);
        }
    }
}

/// Maps operation events of subscribed modules back to their smart services and
/// republishes them through the [`EventBridge`].
pub struct EventForwarder {
    routes: Arc<Routes>,
    relay: BoundedRelay<InboundMessage>,
}

impl EventForwarder {
    #[must_use]
    pub fn new(bridge: Arc<EventBridge>, cfg: &ModuleEventsConfig) -> Self {
        let routes = Arc::new(Routes::new());
        let handler = ForwardHandler {
            routes: Arc::clone(&routes),
            bridge,
        };
        Self {
            relay: BoundedRelay::new(
                "event-forwarder",
                cfg.queue_size,
                cfg.thread_count,
                Arc::new(handler),
            ),
            routes,
        }
    }

    pub fn start(&self) {
        self.relay.start();
    }

    /// Registers (or replaces) the routes of a deployed module.
    pub fn subscribe(&self, module: &Module) {
        let routes = module
            .services
            .iter()
            .filter_map(|s| {
                Some(ServiceRoute {
                    keys: s.reference.as_ref()?.keys.clone(),
                    service_id: s.id.clone(),
                    service_catalog_id: s.service_catalog_id.clone(),
                    name: s.name.clone(),
                    endpoint: s.endpoint.clone(),
                })
            })
            .collect();
        self.routes.insert(module.id.clone(), routes);
        tracing::debug!(module_id = %module.id, "module events subscribed");
    }

    pub fn unsubscribe(&self, module_id: &str) {
        if self.routes.remove(module_id).is_some() {
            tracing::debug!(module_id = %module_id, "module events unsubscribed");
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, module_id: &str) -> bool {
        self.routes.contains_key(module_id)
    }

    /// Queues a raw bus message; never blocks.
    pub fn on_publish(&self, topic: impl Into<String>, payload: Vec<u8>) {
        self.relay.offer(InboundMessage {
            topic: topic.into(),
            payload,
        });
    }

    /// Drains pending messages for up to two seconds; returns the leftover count.
    pub async fn shutdown(&self) -> usize {
        self.relay.shutdown(DRAIN_GRACE).await
    }
}
