//! Secondary-connection handshake
//!
//! Streaming operations (log tail, log download) must not share a socket
//! with latency-sensitive control requests, and the server cannot dial the
//! agent. Instead the server pushes a `new_websocket_connection` request
//! over the primary channel and the agent dials one extra socket back,
//! tagged with an opaque `connect_id`. The pending slot for that id is
//! created strictly before the push is sent, so a fast agent can never
//! arrive before anyone is waiting.
//!
//! The table is generic over the delivered socket type so the handshake
//! timing can be exercised in tests without a real WebSocket.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::client::Client;
use crate::message::{SecondaryConnectRequest, actions};
use crate::{Error, Result};

/// Pending secondary-connection slots keyed by `connect_id`
pub struct SecondaryTable<S> {
    pending: Mutex<HashMap<String, oneshot::Sender<S>>>,
}

impl<S> Default for SecondaryTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SecondaryTable<S> {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<S>>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn create_slot(&self, connect_id: &str) -> oneshot::Receiver<S> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(connect_id.to_string(), tx);
        rx
    }

    fn remove_slot(&self, connect_id: &str) {
        self.lock().remove(connect_id);
    }

    /// Deliver an arriving socket into its pending slot
    ///
    /// Returns the socket back when no slot exists for the `connect_id`
    /// (unknown or already timed out) so the caller can close it. A slot
    /// whose waiter has already given up counts as unmatched too.
    pub fn deliver(&self, connect_id: &str, socket: S) -> std::result::Result<(), S> {
        let Some(tx) = self.lock().remove(connect_id) else {
            return Err(socket);
        };
        tx.send(socket)
    }

    /// Number of slots currently awaiting delivery
    #[must_use]
    pub fn pending_slots(&self) -> usize {
        self.lock().len()
    }

    /// Run the handshake over an agent's primary connection
    ///
    /// Creates the slot, pushes the dial-back request with a bounded send
    /// timeout, and waits (bounded) for the agent's socket. The slot is
    /// removed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestTimeout`] if the push cannot be enqueued or
    /// the agent never dials back within the deadline.
    pub async fn open(&self, client: &Client, action: &str, deadline: Duration) -> Result<S> {
        let connect_id = Uuid::new_v4().to_string();

        // Slot must exist before the push goes out: the agent's new socket
        // may arrive before this task is back on the scheduler.
        let rx = self.create_slot(&connect_id);

        let request = SecondaryConnectRequest {
            connect_id: connect_id.clone(),
            action: action.to_string(),
        };
        if let Err(e) = client
            .push(actions::NEW_WEBSOCKET_CONNECTION, json!(request))
            .await
        {
            self.remove_slot(&connect_id);
            return Err(e);
        }

        tracing::debug!(
            conn_id = %client.conn_id(),
            connect_id = %connect_id,
            action,
            "secondary connection requested"
        );

        let result = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(_)) => Err(Error::DeviceUnavailable(format!(
                "secondary slot {connect_id} dropped"
            ))),
            Err(_) => Err(Error::RequestTimeout(format!(
                "agent {} did not dial back for {action} within {deadline:?}",
                client.conn_id()
            ))),
        };
        self.remove_slot(&connect_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DatakitDescriptor, Message};
    use axum::extract::ws::Message as WsFrame;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn client() -> (Arc<Client>, mpsc::Receiver<WsFrame>) {
        let descriptor = DatakitDescriptor {
            conn_id: "c1".to_string(),
            workspace_uuid: "w1".to_string(),
            ..DatakitDescriptor::default()
        };
        let (client, rx) = Client::new(
            descriptor,
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        (Arc::new(client), rx)
    }

    fn sent_connect_id(frame: &WsFrame) -> String {
        let WsFrame::Text(text) = frame else {
            panic!("expected text frame");
        };
        let msg: Message = serde_json::from_str(text.as_str()).unwrap();
        assert!(msg.is_push());
        assert_eq!(msg.action, actions::NEW_WEBSOCKET_CONNECTION);
        msg.payload::<SecondaryConnectRequest>().unwrap().connect_id
    }

    #[tokio::test]
    async fn handshake_delivers_socket_to_waiter() {
        let table: Arc<SecondaryTable<u32>> = Arc::new(SecondaryTable::new());
        let (client, mut outbound) = client();

        let waiter = {
            let table = Arc::clone(&table);
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                table
                    .open(
                        &client,
                        actions::GET_DATAKIT_LOG_TAIL,
                        Duration::from_secs(1),
                    )
                    .await
            })
        };

        let connect_id = sent_connect_id(&outbound.recv().await.unwrap());
        assert!(table.deliver(&connect_id, 42).is_ok());

        let socket = waiter.await.unwrap().unwrap();
        assert_eq!(socket, 42);
        assert_eq!(table.pending_slots(), 0);
    }

    #[tokio::test]
    async fn timeout_releases_slot() {
        let table: SecondaryTable<u32> = SecondaryTable::new();
        let (client, _outbound) = client();

        let err = table
            .open(
                &client,
                actions::GET_DATAKIT_LOG_DOWNLOAD,
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout(_)));
        assert_eq!(table.pending_slots(), 0);
    }

    #[tokio::test]
    async fn unknown_connect_id_is_rejected_without_side_effects() {
        let table: SecondaryTable<u32> = SecondaryTable::new();
        let (client, mut outbound) = client();

        let waiter_table = Arc::new(table);
        let waiter = {
            let table = Arc::clone(&waiter_table);
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                table
                    .open(
                        &client,
                        actions::GET_DATAKIT_LOG_TAIL,
                        Duration::from_millis(300),
                    )
                    .await
            })
        };
        let _ = outbound.recv().await.unwrap();
        assert_eq!(waiter_table.pending_slots(), 1);

        // A stranger dials in with a bogus token: handed back, slot untouched
        assert_eq!(waiter_table.deliver("bogus", 7), Err(7));
        assert_eq!(waiter_table.pending_slots(), 1);

        waiter.abort();
    }

    #[tokio::test]
    async fn failed_push_cleans_up_slot() {
        let table: SecondaryTable<u32> = SecondaryTable::new();
        let (client, outbound) = client();
        drop(outbound); // connection already gone

        let err = table
            .open(
                &client,
                actions::GET_DATAKIT_LOG_TAIL,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable(_)));
        assert_eq!(table.pending_slots(), 0);
    }

    #[tokio::test]
    async fn slot_exists_before_push_is_sent() {
        let table: Arc<SecondaryTable<u32>> = Arc::new(SecondaryTable::new());
        let (client, mut outbound) = client();

        let waiter = {
            let table = Arc::clone(&table);
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                table
                    .open(&client, actions::GET_DATAKIT_LOG_TAIL, Duration::from_secs(1))
                    .await
            })
        };

        // By the time the push is observable the slot must already be live,
        // so an immediate dial-back always finds a waiter.
        let connect_id = sent_connect_id(&outbound.recv().await.unwrap());
        assert_eq!(table.pending_slots(), 1);
        table.deliver(&connect_id, 9).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 9);
    }
}
