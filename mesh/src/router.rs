//! Action dispatch
//!
//! Request envelopes are routed to the handler registered for their action
//! and answered on the same connection before the next line is read.
//! Response envelopes are routed to the response handler for their action.
//! Replies nobody asked for are still routed but logged as unsolicited.
//!
//! Handler errors stop here: a request-style action gets an error-status
//! reply, a fire-and-forget action gets a log line.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{MeshError, MeshResult},
    metrics,
    protocol::{Action, Envelope, RequestEnvelope, ResponseEnvelope},
    transport::Connection,
};

pub trait RequestHandler: Send + Sync {
    fn handle(
        &self,
        conn: &Arc<Connection>,
        payload: Option<Value>,
    ) -> MeshResult<Option<ResponseEnvelope>>;
}

impl<F> RequestHandler for F
where
    F: Fn(&Arc<Connection>, Option<Value>) -> MeshResult<Option<ResponseEnvelope>> + Send + Sync,
{
    fn handle(
        &self,
        conn: &Arc<Connection>,
        payload: Option<Value>,
    ) -> MeshResult<Option<ResponseEnvelope>> {
        self(conn, payload)
    }
}

pub trait ResponseHandler: Send + Sync {
    fn handle(&self, conn: &Arc<Connection>, response: ResponseEnvelope);
}

impl<F> ResponseHandler for F
where
    F: Fn(&Arc<Connection>, ResponseEnvelope) + Send + Sync,
{
    fn handle(&self, conn: &Arc<Connection>, response: ResponseEnvelope) {
        self(conn, response)
    }
}

#[derive(Default)]
pub struct MessageRouter {
    requests: DashMap<Action, Arc<dyn RequestHandler>>,
    responses: DashMap<Action, Arc<dyn ResponseHandler>>,
    /// Expected reply action -> replies still outstanding
    pending: DashMap<Action, usize>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("requests", &self.requests.len())
            .field("responses", &self.responses.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a request action. A second registration for
    /// the same action replaces the first.
    pub fn register_action(&self, action: Action, handler: Arc<dyn RequestHandler>) {
        if self.requests.insert(action, handler).is_some() {
            debug!(action = %action, "Replaced request handler");
        }
    }

    pub fn register_response_handler(&self, action: Action, handler: Arc<dyn ResponseHandler>) {
        if self.responses.insert(action, handler).is_some() {
            debug!(action = %action, "Replaced response handler");
        }
    }

    /// Record `copies` outgoing requests so their replies can be matched.
    pub fn note_request_sent(&self, request: &RequestEnvelope, copies: usize) {
        if copies == 0 {
            return;
        }
        if let Ok(action) = request.action.parse::<Action>() {
            *self.pending.entry(action.reply_action()).or_insert(0) += copies;
        }
    }

    /// Replies of this action still expected
    pub fn outstanding(&self, reply: Action) -> usize {
        self.pending.get(&reply).map(|count| *count).unwrap_or(0)
    }

    /// Consume one outstanding reply. False when none was expected.
    fn take_pending(&self, reply: Action) -> bool {
        match self.pending.entry(reply) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Route one decoded envelope. Returns the reply to write back, if any.
    pub fn dispatch(&self, conn: &Arc<Connection>, envelope: Envelope) -> Option<ResponseEnvelope> {
        match envelope {
            Envelope::Request(request) => self.dispatch_request(conn, request),
            Envelope::Response(response) => {
                self.dispatch_response(conn, response);
                None
            }
        }
    }

    fn dispatch_request(
        &self,
        conn: &Arc<Connection>,
        request: RequestEnvelope,
    ) -> Option<ResponseEnvelope> {
        let action = match request.action.parse::<Action>() {
            Ok(action) => action,
            Err(e) => {
                warn!(conn = conn.id(), "Rejecting request: {}", e);
                return Some(ResponseEnvelope::error(request.action, e.to_string()));
            }
        };
        metrics::record_envelope_dispatched(action, false);

        // Clone the handler out so the map shard is not held while it runs.
        let handler = self.requests.get(&action).map(|entry| entry.value().clone());
        let result = match handler {
            Some(handler) => handler.handle(conn, request.payload),
            None => Err(MeshError::UnknownAction(action.to_string())),
        };

        match result {
            Ok(reply) => reply,
            Err(e) if action.expects_reply() => {
                debug!(conn = conn.id(), action = %action, "Handler failed: {}", e);
                Some(ResponseEnvelope::error(action.reply_action().as_str(), e.to_string()))
            }
            Err(e) => {
                warn!(conn = conn.id(), action = %action, "Dropping failed fire-and-forget request: {}", e);
                None
            }
        }
    }

    fn dispatch_response(&self, conn: &Arc<Connection>, response: ResponseEnvelope) {
        let action = match response.action.parse::<Action>() {
            Ok(action) => action,
            Err(e) => {
                warn!(conn = conn.id(), "Dropping response: {}", e);
                return;
            }
        };
        metrics::record_envelope_dispatched(action, true);
        if !self.take_pending(action) {
            debug!(conn = conn.id(), action = %action, "Unsolicited response");
        }

        let handler = self.responses.get(&action).map(|entry| entry.value().clone());
        match handler {
            Some(handler) => handler.handle(conn, response),
            None => debug!(conn = conn.id(), action = %action, "No response handler registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{protocol::Status, transport::Connection};

    fn ok_handler(data: Value) -> Arc<dyn RequestHandler> {
        Arc::new(
            move |_: &Arc<Connection>, _: Option<Value>| -> MeshResult<Option<ResponseEnvelope>> {
                Ok(Some(ResponseEnvelope::success(Action::CheckRoots, Some(data.clone()))))
            },
        )
    }

    #[tokio::test]
    async fn test_request_routed_to_handler() {
        let router = MessageRouter::new();
        router.register_action(Action::CheckRoots, ok_handler(json!({"USER": "EMPTY"})));
        let (conn, _rx) = Connection::detached();

        let reply = router
            .dispatch(&conn, Envelope::Request(RequestEnvelope::new(Action::CheckRoots, None)))
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.data, Some(json!({"USER": "EMPTY"})));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let router = MessageRouter::new();
        router.register_action(Action::CheckRoots, ok_handler(json!(1)));
        router.register_action(Action::CheckRoots, ok_handler(json!(2)));
        let (conn, _rx) = Connection::detached();

        let reply = router
            .dispatch(&conn, RequestEnvelope::new(Action::CheckRoots, None).into())
            .unwrap();
        assert_eq!(reply.data, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let router = MessageRouter::new();
        router.register_action(
            Action::GetEntity,
            Arc::new(
                |_: &Arc<Connection>, _: Option<Value>| -> MeshResult<Option<ResponseEnvelope>> {
                    Err(MeshError::invalid_payload("get-entity", "missing id"))
                },
            ),
        );
        let (conn, _rx) = Connection::detached();

        let reply = router
            .dispatch(&conn, RequestEnvelope::new(Action::GetEntity, None).into())
            .unwrap();
        assert_eq!(reply.status, Status::Error);
        assert_eq!(reply.action, "get-entity");
        assert!(reply.message.unwrap().contains("missing id"));
    }

    #[tokio::test]
    async fn test_fire_and_forget_error_is_swallowed() {
        let router = MessageRouter::new();
        router.register_action(
            Action::Ping,
            Arc::new(
                |_: &Arc<Connection>, _: Option<Value>| -> MeshResult<Option<ResponseEnvelope>> {
                    Err(MeshError::invalid_payload("ping", "missing uuid"))
                },
            ),
        );
        let (conn, _rx) = Connection::detached();

        assert!(router
            .dispatch(&conn, RequestEnvelope::new(Action::Ping, None).into())
            .is_none());
        // unregistered fire-and-forget action
        assert!(router
            .dispatch(&conn, RequestEnvelope::new(Action::ListPeersRequest, None).into())
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_request_action_gets_error_reply() {
        let router = MessageRouter::new();
        let (conn, _rx) = Connection::detached();
        let request = RequestEnvelope {
            action: "self-destruct".into(),
            payload: None,
        };

        let reply = router.dispatch(&conn, request.into()).unwrap();
        assert_eq!(reply.status, Status::Error);
        assert_eq!(reply.action, "self-destruct");
    }

    fn counting_pong_handler(router: &MessageRouter) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        router.register_response_handler(
            Action::Pong,
            Arc::new(move |_: &Arc<Connection>, resp: ResponseEnvelope| {
                assert!(resp.is_success());
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        calls
    }

    #[tokio::test]
    async fn test_response_consumes_pending_and_calls_handler() {
        let router = MessageRouter::new();
        let calls = counting_pong_handler(&router);
        let (conn, _rx) = Connection::detached();

        router.note_request_sent(&RequestEnvelope::new(Action::Ping, None), 2);
        assert_eq!(router.outstanding(Action::Pong), 2);

        let reply = router.dispatch(&conn, ResponseEnvelope::success(Action::Pong, None).into());
        assert!(reply.is_none());
        assert_eq!(router.outstanding(Action::Pong), 1);

        router.dispatch(&conn, ResponseEnvelope::success(Action::Pong, None).into());
        assert_eq!(router.outstanding(Action::Pong), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsolicited_response_still_routed() {
        let router = MessageRouter::new();
        let calls = counting_pong_handler(&router);
        let (conn, _rx) = Connection::detached();

        router.dispatch(&conn, ResponseEnvelope::success(Action::Pong, None).into());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // nothing goes negative or lingers
        assert_eq!(router.outstanding(Action::Pong), 0);

        router.note_request_sent(&RequestEnvelope::new(Action::CheckRoots, None), 0);
        assert_eq!(router.outstanding(Action::CheckRoots), 0);
    }
}
