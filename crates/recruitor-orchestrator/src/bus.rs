use crate::registry::AgentRegistry;
use parking_lot::Mutex;
use recruitor_core::{
    EventHub, EventMessage, Message, OrchestrationEvent, RecruitorError, RecruitorResult,
    RequestMessage, ResponseMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Inbound queue handed to a subscriber. One consumer drains it in order.
pub type Inbox = mpsc::UnboundedReceiver<Message>;

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<ResponseMessage>>>>;

/// Removes a pending correlation entry when the waiting caller goes away,
/// whether it got an answer, timed out or was dropped mid-wait.
struct PendingGuard {
    pending: PendingMap,
    id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Routes messages between workers and correlates requests with responses.
///
/// Delivery is in-process and best-effort: the bus never retries. A message
/// addressed to an unknown recipient produces a `delivery-failed` event
/// instead of an error in the sender.
pub struct MessageBus {
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    pending: PendingMap,
    default_timeout: Duration,
    registry: Option<Arc<AgentRegistry>>,
    events: EventHub,
}

impl MessageBus {
    /// Creates a bus with no subscribers and the default request timeout.
    pub fn new(events: EventHub) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout: Duration::from_secs(30),
            registry: None,
            events,
        }
    }

    /// Refresh worker heartbeats in `registry` on every successful delivery.
    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Timeout for requests that do not carry their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Registers the inbound queue for `agent_id`, replacing any previous one.
    pub fn subscribe(&self, agent_id: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .subscribers
            .lock()
            .insert(agent_id.to_string(), tx)
            .is_some()
        {
            debug!(agent_id = %agent_id, "Replaced existing subscription");
        }
        rx
    }

    /// Drops a worker's inbox. Returns false when it was not subscribed.
    pub fn unsubscribe(&self, agent_id: &str) -> bool {
        self.subscribers.lock().remove(agent_id).is_some()
    }

    /// Whether `agent_id` currently has an inbox.
    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.subscribers.lock().contains_key(agent_id)
    }

    /// Number of live inboxes.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Delivers a message and reports whether it reached anyone.
    ///
    /// Responses go to the caller waiting on the matching request; one with
    /// no waiting caller is dropped. Events without a recipient go to every
    /// subscriber.
    pub async fn send(&self, message: Message) -> bool {
        match message {
            Message::Response(response) => self.resolve(response),
            Message::Event(event) if event.to.is_none() => self.broadcast(event).await > 0,
            other => {
                let recipient = other.recipient().unwrap_or_default().to_string();
                self.deliver(&recipient, other).await
            }
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// Resolves with exactly one outcome: the response, a
    /// [`RecruitorError::RequestTimeout`], or a
    /// [`RecruitorError::DeliveryFailed`] when the recipient is unknown.
    pub async fn send_request(&self, request: RequestMessage) -> RecruitorResult<ResponseMessage> {
        let request_id = request.id;
        let recipient = request.to.clone();
        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.default_timeout.as_millis() as u64);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: request_id,
        };

        if !self.deliver(&recipient, Message::Request(request)).await {
            return Err(RecruitorError::DeliveryFailed(format!(
                "no subscriber '{recipient}'"
            )));
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) if response.timed_out => Err(RecruitorError::RequestTimeout {
                request_id,
                timeout_ms,
            }),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RecruitorError::DeliveryFailed(format!(
                "request {request_id} to '{recipient}' was abandoned"
            ))),
            Err(_) => {
                warn!(request_id = %request_id, recipient = %recipient, timeout_ms, "Request timed out");
                Err(RecruitorError::RequestTimeout {
                    request_id,
                    timeout_ms,
                })
            }
        }
    }

    /// Delivers an event to every current subscriber and returns how many received it.
    pub async fn broadcast(&self, event: EventMessage) -> usize {
        let targets: Vec<(String, mpsc::UnboundedSender<Message>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        let mut delivered = Vec::with_capacity(targets.len());
        for (agent_id, tx) in targets {
            if tx.send(Message::Event(event.clone())).is_ok() {
                delivered.push(agent_id);
            } else {
                self.drop_closed(&agent_id);
            }
        }
        for agent_id in &delivered {
            self.touch(agent_id).await;
        }
        debug!(event = %event.name, recipients = delivered.len(), "Broadcast event");
        delivered.len()
    }

    fn resolve(&self, response: ResponseMessage) -> bool {
        let waiter = self.pending.lock().remove(&response.correlation_id);
        match waiter {
            Some(tx) => {
                let correlation_id = response.correlation_id;
                if tx.send(response).is_err() {
                    debug!(correlation_id = %correlation_id, "Caller stopped waiting before the response arrived");
                    return false;
                }
                true
            }
            None => {
                warn!(
                    correlation_id = %response.correlation_id,
                    from = %response.from,
                    "Dropping response with no pending request"
                );
                false
            }
        }
    }

    async fn deliver(&self, recipient: &str, message: Message) -> bool {
        let tx = self.subscribers.lock().get(recipient).cloned();
        let message_id = message.id();
        let kind = message.kind();

        let reason = match tx {
            Some(tx) => match tx.send(message) {
                Ok(()) => {
                    debug!(message_id = %message_id, kind, recipient = %recipient, "Delivered");
                    self.touch(recipient).await;
                    return true;
                }
                Err(_) => {
                    self.drop_closed(recipient);
                    "subscriber queue closed"
                }
            },
            None => "unknown recipient",
        };

        warn!(message_id = %message_id, kind, recipient = %recipient, reason, "Delivery failed");
        self.events.emit(OrchestrationEvent::DeliveryFailed {
            message_id,
            kind: kind.to_string(),
            recipient: Some(recipient.to_string()),
            reason: reason.to_string(),
        });
        false
    }

    fn drop_closed(&self, agent_id: &str) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.get(agent_id).is_some_and(|tx| tx.is_closed()) {
            subscribers.remove(agent_id);
        }
    }

    async fn touch(&self, agent_id: &str) {
        if let Some(registry) = &self.registry {
            registry.update_heartbeat(agent_id).await;
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(EventHub::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use recruitor_core::{AgentDescriptor, AgentInfo, AgentStatus};
    use serde_json::json;

    /// Answers every request on `inbox` with the payload echoed back.
    fn spawn_echo(bus: Arc<MessageBus>, mut inbox: Inbox) {
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                if let Message::Request(req) = msg {
                    let resp = ResponseMessage::success(&req, req.payload.clone());
                    bus.send(Message::Response(resp)).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let bus = MessageBus::default();
        let _a = bus.subscribe("w1");
        let _b = bus.subscribe("w1");
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe("w1"));
        assert!(!bus.unsubscribe("w1"));
        assert!(!bus.is_subscribed("w1"));
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let bus = Arc::new(MessageBus::default());
        let inbox = bus.subscribe("echo");
        spawn_echo(Arc::clone(&bus), inbox);

        let req = RequestMessage::new("engine", "echo", "search", json!({"q": "rust"}));
        let id = req.id;
        let resp = bus.send_request(req).await.unwrap();
        assert_eq!(resp.correlation_id, id);
        assert_eq!(resp.data, Some(json!({"q": "rust"})));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_recipient_emits_delivery_failed() {
        let events = EventHub::new(8);
        let mut rx = events.subscribe();
        let bus = MessageBus::new(events);

        let delivered = bus
            .send(Message::Event(EventMessage::new("a", "ping", json!(null)).to("ghost")))
            .await;
        assert!(!delivered);
        assert_eq!(rx.recv().await.unwrap().name(), "delivery-failed");

        let err = bus
            .send_request(RequestMessage::new("a", "ghost", "scrape", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RecruitorError::DeliveryFailed(_)));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_late_response_dropped() {
        let bus = Arc::new(MessageBus::default());
        let mut inbox = bus.subscribe("slow");

        let req = RequestMessage::new("engine", "slow", "scrape", json!({})).with_timeout(100);
        let err = bus.send_request(req).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(bus.pending_count(), 0);

        // The worker answers after the caller gave up.
        let Some(Message::Request(req)) = inbox.recv().await else {
            panic!("expected the request in the inbox");
        };
        let late = ResponseMessage::success(&req, json!("late"));
        assert!(!bus.send(Message::Response(late)).await);
    }

    #[tokio::test]
    async fn test_worker_timeout_response_maps_to_timeout() {
        let bus = Arc::new(MessageBus::default());
        let mut inbox = bus.subscribe("w");
        let responder = Arc::clone(&bus);
        tokio::spawn(async move {
            if let Some(Message::Request(req)) = inbox.recv().await {
                responder
                    .send(Message::Response(ResponseMessage::timeout(&req, 50)))
                    .await;
            }
        });
        let req = RequestMessage::new("engine", "w", "scrape", json!({})).with_timeout(50);
        let err = bus.send_request(req).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_dropped() {
        let bus = MessageBus::default();
        let orphan = RequestMessage::new("a", "b", "x", json!({}));
        let resp = ResponseMessage::success(&orphan, json!(1));
        assert!(!bus.send(Message::Response(resp)).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_current_subscribers_only() {
        let bus = MessageBus::default();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");
        let n = bus
            .broadcast(EventMessage::new("registry", "config-reloaded", json!({})))
            .await;
        assert_eq!(n, 2);
        let mut late = bus.subscribe("late");

        assert!(matches!(a.recv().await, Some(Message::Event(_))));
        assert!(matches!(b.recv().await, Some(Message::Event(_))));
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue_counts_as_failed_delivery() {
        let bus = MessageBus::default();
        drop(bus.subscribe("gone"));
        let sent = bus
            .send(Message::Event(EventMessage::new("a", "ping", json!(null)).to("gone")))
            .await;
        assert!(!sent);
        assert!(!bus.is_subscribed("gone"));
    }

    #[tokio::test]
    async fn test_delivery_refreshes_heartbeat() {
        let registry = Arc::new(AgentRegistry::default());
        registry
            .register(
                AgentInfo::new(&AgentDescriptor::new("w1", "w1", "generic"), vec![])
                    .with_status(AgentStatus::Offline),
            )
            .await;
        let bus = MessageBus::default().with_registry(Arc::clone(&registry));
        let _inbox = bus.subscribe("w1");

        assert!(
            bus.send(Message::Event(EventMessage::new("a", "ping", json!(null)).to("w1")))
                .await
        );
        assert_eq!(registry.get_agent("w1").await.unwrap().status, AgentStatus::Idle);
    }
}
