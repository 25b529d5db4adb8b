// =============================================================================
// Fan-out broadcaster.
//
// A single task owns every open session's BufferProducer, which makes it the
// sole producer for all connection buffers. Commands are processed in order,
// so Attach/Detach never race a Dispatch.
//
// Each event's data is serialized once; only the envelope (which carries the
// per-session sequence) is rebuilt per subscriber. Events may be restricted
// by shard (entity id) and by intent; both filters apply before a sequence
// number is assigned.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::buffer::BufferProducer;
use super::frame::encode_text_frame;
use super::intents;
use super::metrics::{GatewayMetrics, add, incr};
use super::payload::DispatchTemplate;
use super::shard::ShardIdentity;

/// Event to push to every session responsible for it.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    pub name: String,
    pub data: Value,
    /// Entity the event concerns. `None` broadcasts to every session.
    pub entity_id: Option<u64>,
    /// Intent bits a session needs (any one of them) to receive the event.
    pub intent: Option<u64>,
}

impl DispatchEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            entity_id: None,
            intent: None,
        }
    }

    pub fn for_entity(mut self, entity_id: u64) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn requires_intent(mut self, intent: u64) -> Self {
        self.intent = Some(intent);
        self
    }
}

pub(crate) enum FanoutCommand {
    Attach {
        connection_id: u64,
        identity: ShardIdentity,
        intents: u64,
        producer: BufferProducer,
    },
    Detach {
        connection_id: u64,
    },
    Dispatch(DispatchEvent),
    SubscriberCount(oneshot::Sender<usize>),
    Shutdown,
}

/// Cloneable sender side of the broadcaster.
#[derive(Clone)]
pub struct FanoutHandle {
    tx: mpsc::UnboundedSender<FanoutCommand>,
}

impl FanoutHandle {
    /// Queue an event. Returns `false` if the broadcaster has stopped.
    pub fn dispatch(&self, event: DispatchEvent) -> bool {
        self.tx.send(FanoutCommand::Dispatch(event)).is_ok()
    }

    pub(crate) fn attach(
        &self,
        connection_id: u64,
        identity: ShardIdentity,
        intents: u64,
        producer: BufferProducer,
    ) -> bool {
        self.tx
            .send(FanoutCommand::Attach {
                connection_id,
                identity,
                intents,
                producer,
            })
            .is_ok()
    }

    pub(crate) fn detach(&self, connection_id: u64) {
        let _ = self.tx.send(FanoutCommand::Detach { connection_id });
    }

    /// Number of attached sessions, after every previously queued command
    /// has been applied.
    pub async fn subscriber_count(&self) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(FanoutCommand::SubscriberCount(tx)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(FanoutCommand::Shutdown);
    }
}

struct Subscriber {
    identity: ShardIdentity,
    intents: u64,
    producer: BufferProducer,
    sequence: u64,
}

pub fn spawn_broadcaster(metrics: Arc<GatewayMetrics>) -> (FanoutHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_broadcaster(rx, metrics));
    (FanoutHandle { tx }, handle)
}

async fn run_broadcaster(mut rx: mpsc::UnboundedReceiver<FanoutCommand>, metrics: Arc<GatewayMetrics>) {
    let mut subscribers: HashMap<u64, Subscriber> = HashMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            FanoutCommand::Attach {
                connection_id,
                identity,
                intents,
                producer,
            } => {
                subscribers.insert(
                    connection_id,
                    Subscriber {
                        identity,
                        intents,
                        producer,
                        sequence: 0,
                    },
                );
                debug!(conn_id = connection_id, shard = %identity, "attached to fan-out");
            }
            FanoutCommand::Detach { connection_id } => {
                subscribers.remove(&connection_id);
            }
            FanoutCommand::Dispatch(event) => {
                deliver(&mut subscribers, &event, &metrics);
            }
            FanoutCommand::SubscriberCount(reply) => {
                let _ = reply.send(subscribers.len());
            }
            FanoutCommand::Shutdown => break,
        }
    }
    debug!(remaining = subscribers.len(), "fan-out broadcaster stopped");
}

fn deliver(subscribers: &mut HashMap<u64, Subscriber>, event: &DispatchEvent, metrics: &GatewayMetrics) {
    incr(&metrics.events_dispatched);
    let template = match DispatchTemplate::new(&event.name, &event.data) {
        Ok(template) => template,
        Err(e) => {
            warn!(event = %event.name, error = %e, "event not serializable, dropped");
            return;
        }
    };

    let mut delivered = 0u64;
    let mut dropped = 0u64;
    let mut filtered = 0u64;
    for (conn_id, sub) in subscribers.iter_mut() {
        if let Some(entity_id) = event.entity_id
            && !sub.identity.is_responsible_for(entity_id)
        {
            continue;
        }
        if !intents::allows(sub.intents, event.intent) {
            filtered += 1;
            continue;
        }
        // Gaps in "s" tell the client an event was dropped for it.
        sub.sequence += 1;
        if sub.producer.try_write(&encode_text_frame(&template.render(sub.sequence))) {
            delivered += 1;
        } else {
            dropped += 1;
            debug!(
                conn_id = *conn_id,
                lag = sub.producer.lag_counter(),
                usage = sub.producer.usage_percent(),
                "buffer full, event dropped"
            );
        }
    }
    add(&metrics.events_delivered, delivered);
    add(&metrics.events_dropped, dropped);
    add(&metrics.events_filtered, filtered);
}
