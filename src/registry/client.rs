//! Per-agent connection state
//!
//! A [`Client`] is the server-side runtime object for one agent's physical
//! socket: a bounded FIFO send queue drained by the write loop, a table of
//! pending request-correlation slots resolved by the read loop, and a
//! wrapping request-id counter. The socket loops themselves live in the
//! registry module; the client only owns the queue ends, which keeps it
//! constructible in tests without a socket.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::ws::{Message as WsFrame, Utf8Bytes};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::message::{DatakitDescriptor, Message};
use crate::{Error, Result};

/// Bound of the per-connection send queue
pub const SEND_QUEUE_CAPACITY: usize = 128;

/// Correlation slots plus the id counter, guarded together so id allocation
/// and slot creation are a single atomic step.
struct PendingTable {
    next_id: u64,
    slots: HashMap<u64, oneshot::Sender<Message>>,
}

impl PendingTable {
    /// Allocate the next request id and its response slot.
    ///
    /// Wraps from `u64::MAX - 1` back to 1, skipping ids that still have a
    /// pending slot. In-flight requests are always far fewer than the id
    /// space, so the skip loop terminating is a liveness assumption rather
    /// than a correctness guarantee under adversarial load.
    fn allocate(&mut self) -> (u64, oneshot::Receiver<Message>) {
        loop {
            self.next_id = if self.next_id >= u64::MAX - 1 {
                1
            } else {
                self.next_id + 1
            };
            if !self.slots.contains_key(&self.next_id) {
                break;
            }
        }
        let (tx, rx) = oneshot::channel();
        self.slots.insert(self.next_id, tx);
        (self.next_id, rx)
    }
}

/// Server-side runtime object for one agent connection
pub struct Client {
    descriptor: DatakitDescriptor,
    outbound: mpsc::Sender<WsFrame>,
    pending: Mutex<PendingTable>,
    cancel: CancellationToken,
    send_timeout: Duration,
    request_timeout: Duration,
}

impl Client {
    /// Create a client and the receiving end of its send queue
    ///
    /// The returned receiver is handed to the write loop; everything sent
    /// through [`Client::push`] / [`Client::request`] is drained from it in
    /// FIFO order.
    #[must_use]
    pub fn new(
        descriptor: DatakitDescriptor,
        send_timeout: Duration,
        request_timeout: Duration,
    ) -> (Self, mpsc::Receiver<WsFrame>) {
        let (outbound, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let client = Self {
            descriptor,
            outbound,
            pending: Mutex::new(PendingTable {
                next_id: 0,
                slots: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
            send_timeout,
            request_timeout,
        };
        (client, outbound_rx)
    }

    /// Identity key of the agent this connection belongs to
    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.descriptor.conn_id
    }

    /// Handshake descriptor the agent registered with
    #[must_use]
    pub const fn descriptor(&self) -> &DatakitDescriptor {
        &self.descriptor
    }

    /// Token observed by both socket loops; cancelled on [`Client::exit`]
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Idempotent teardown: signals both loops to stop
    pub fn exit(&self) {
        self.cancel.cancel();
    }

    /// Whether this connection has been torn down
    #[must_use]
    pub fn is_exited(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enqueue a one-way push with a bounded send timeout
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestTimeout`] if the queue stays full past the
    /// send deadline, [`Error::DeviceUnavailable`] if the connection is gone.
    pub async fn push(&self, action: &str, data: Value) -> Result<()> {
        self.enqueue(&Message::push(action, data)).await
    }

    /// Issue a correlated request and await its reply
    ///
    /// Allocates the next request id atomically with its response slot,
    /// enqueues the frame, then blocks the calling task (never the read
    /// loop) until the matching reply arrives or the deadline passes. The
    /// slot is released on every exit path.
    ///
    /// # Errors
    ///
    /// [`Error::RequestTimeout`] on a send or reply deadline,
    /// [`Error::ProtocolMismatch`] if the reply carries a different action,
    /// [`Error::DeviceUnavailable`] if the connection dies mid-flight.
    pub async fn request(&self, action: &str, data: Value) -> Result<Message> {
        let (id, rx) = self.allocate_slot();

        if let Err(e) = self.enqueue(&Message::request(id, action, data)).await {
            self.release_slot(id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.release_slot(id);
                return Err(Error::DeviceUnavailable(format!(
                    "{} disconnected while awaiting {action}",
                    self.conn_id()
                )));
            }
            Err(_) => {
                self.release_slot(id);
                return Err(Error::RequestTimeout(format!(
                    "no reply to {action} (id {id}) within {:?}",
                    self.request_timeout
                )));
            }
        };

        if reply.action != action {
            return Err(Error::ProtocolMismatch(format!(
                "reply for id {id} carries action {} (expected {action})",
                reply.action
            )));
        }
        Ok(reply)
    }

    /// Hand an inbound reply to the caller waiting on its id
    ///
    /// Non-blocking: the oneshot handoff either lands immediately or the
    /// reply is dropped (slot gone or caller already timed out). Returns
    /// false on a drop so the read loop can log it; the read loop is never
    /// stalled by a slow caller.
    pub fn resolve_reply(&self, reply: Message) -> bool {
        let slot = {
            let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.slots.remove(&reply.id)
        };
        match slot {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Number of requests currently awaiting replies
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .slots
            .len()
    }

    fn allocate_slot(&self) -> (u64, oneshot::Receiver<Message>) {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allocate()
    }

    fn release_slot(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .slots
            .remove(&id);
    }

    async fn enqueue(&self, msg: &Message) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        let frame = WsFrame::Text(Utf8Bytes::from(text));
        match self.outbound.send_timeout(frame, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(Error::RequestTimeout(format!(
                "send queue full for {} past {:?}",
                self.conn_id(),
                self.send_timeout
            ))),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(Error::DeviceUnavailable(
                format!("{} send queue closed", self.conn_id()),
            )),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn_id", &self.descriptor.conn_id)
            .field("pending", &self.pending_requests())
            .field("exited", &self.is_exited())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn descriptor(conn_id: &str) -> DatakitDescriptor {
        DatakitDescriptor {
            conn_id: conn_id.to_string(),
            workspace_uuid: "w1".to_string(),
            ..DatakitDescriptor::default()
        }
    }

    fn client() -> (Arc<Client>, mpsc::Receiver<WsFrame>) {
        let (client, rx) = Client::new(
            descriptor("c1"),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        (Arc::new(client), rx)
    }

    fn decode(frame: &WsFrame) -> Message {
        let WsFrame::Text(text) = frame else {
            panic!("expected text frame");
        };
        serde_json::from_str(text.as_str()).unwrap()
    }

    #[test]
    fn id_allocation_is_injective_while_pending() {
        let (client, _rx) = client();
        let mut seen = std::collections::HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..1000 {
            let (id, rx) = client.allocate_slot();
            assert!(seen.insert(id), "id {id} handed out twice");
            receivers.push(rx);
        }
        assert_eq!(client.pending_requests(), 1000);
    }

    #[test]
    fn id_wraps_and_skips_pending_slots() {
        let (client, _rx) = client();
        {
            let mut pending = client.pending.lock().unwrap();
            pending.next_id = u64::MAX - 2;
        }
        let (id_a, _rx_a) = client.allocate_slot();
        assert_eq!(id_a, u64::MAX - 1);
        // Wraps back to 1, then must skip 1 while its slot is live
        let (id_b, _rx_b) = client.allocate_slot();
        assert_eq!(id_b, 1);
        let (id_c, _rx_c) = client.allocate_slot();
        assert_eq!(id_c, 2);
    }

    #[tokio::test]
    async fn request_resolves_matching_reply() {
        let (client, mut rx) = client();

        let requester = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .request("get_datakit_stats_action", serde_json::json!({}))
                    .await
            })
        };

        let sent = decode(&rx.recv().await.unwrap());
        assert!(sent.id > 0);

        let delivered = client.resolve_reply(Message {
            id: sent.id,
            action: sent.action.clone(),
            data: serde_json::json!({"cpu": 0.5}),
        });
        assert!(delivered);

        let reply = requester.await.unwrap().unwrap();
        assert_eq!(reply.data["cpu"], 0.5);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn mismatched_action_is_protocol_error() {
        let (client, mut rx) = client();

        let requester = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .request("upgrade_datakit_action", serde_json::Value::Null)
                    .await
            })
        };

        let sent = decode(&rx.recv().await.unwrap());
        client.resolve_reply(Message {
            id: sent.id,
            action: "restart_datakit_action".to_string(),
            data: serde_json::Value::Null,
        });

        let err = requester.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch(_)));
    }

    #[tokio::test]
    async fn reply_timeout_releases_slot() {
        let (client, _rx) = client();
        let err = client
            .request("get_datakit_stats_action", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(_)));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn full_send_queue_times_out() {
        let (client, _rx) = client();
        // Fill the bounded queue without draining it
        for _ in 0..SEND_QUEUE_CAPACITY {
            client
                .push("update_datakit_status", serde_json::json!({}))
                .await
                .unwrap();
        }
        let err = client
            .push("update_datakit_status", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(_)));
    }

    #[tokio::test]
    async fn dropped_receiver_reports_unavailable() {
        let (client, rx) = client();
        drop(rx);
        let err = client
            .push("update_datakit_status", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
    }

    #[test]
    fn unknown_reply_is_dropped() {
        let (client, _rx) = client();
        let delivered = client.resolve_reply(Message {
            id: 99,
            action: "get_datakit_stats_action".to_string(),
            data: serde_json::Value::Null,
        });
        assert!(!delivered);
    }

    #[test]
    fn exit_is_idempotent() {
        let (client, _rx) = client();
        assert!(!client.is_exited());
        client.exit();
        client.exit();
        assert!(client.is_exited());
    }
}
