//! Connection registry
//!
//! The single authority over live agent connections. Register, unregister
//! and lookup events flow through ordered queues into one control task that
//! exclusively owns the live-connection map, so the map and the duplicate
//! check are never touched concurrently and no call site holds a lock on
//! them. Each accepted connection then runs a read loop and a write loop as
//! two independent tasks on the shared supervisor.

pub mod client;
pub mod secondary;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsFrame, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::db::{DatakitRecord, DatakitRepo, DatakitStatus};
use crate::message::{DatakitDescriptor, Message, actions};
use crate::{Error, Result};

pub use client::Client;
pub use secondary::SecondaryTable;

/// Shared handle to a live connection
pub type ClientHandle = Arc<Client>;

/// Bound of the registry event queues
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Timeouts governing every blocking operation in the registry
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Deadline for enqueueing a frame onto a connection's send queue
    pub send_timeout: Duration,
    /// Deadline for a correlated reply
    pub request_timeout: Duration,
    /// Deadline for an agent to dial back a secondary connection
    pub secondary_timeout: Duration,
    /// Read-loop idle cutoff; agents heartbeat well inside this window
    pub read_idle_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            secondary_timeout: Duration::from_secs(30),
            read_idle_timeout: Duration::from_secs(90),
        }
    }
}

struct Registration {
    client: ClientHandle,
    ack: oneshot::Sender<Result<DatakitRecord>>,
}

struct Lookup {
    conn_id: String,
    reply: oneshot::Sender<Option<ClientHandle>>,
}

/// Connection registry (manager)
pub struct Registry {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientHandle>,
    lookup_tx: mpsc::Sender<Lookup>,
    live_count: Arc<AtomicUsize>,
    repo: DatakitRepo,
    secondary: SecondaryTable<WebSocket>,
    settings: RegistrySettings,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Registry {
    /// Create the registry and spawn its control task on the supervisor
    #[must_use]
    pub fn spawn(
        repo: DatakitRepo,
        settings: RegistrySettings,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (lookup_tx, lookup_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let live_count = Arc::new(AtomicUsize::new(0));

        tracker.spawn(control_task(
            register_rx,
            unregister_rx,
            lookup_rx,
            repo.clone(),
            Arc::clone(&live_count),
            cancel.clone(),
        ));

        Arc::new(Self {
            register_tx,
            unregister_tx,
            lookup_tx,
            live_count,
            repo,
            secondary: SecondaryTable::new(),
            settings,
            tracker,
            cancel,
        })
    }

    /// Number of live connections (gauge maintained by the control task)
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.live_count.load(Ordering::Relaxed)
    }

    /// Device record repository backing this registry
    #[must_use]
    pub const fn repo(&self) -> &DatakitRepo {
        &self.repo
    }

    /// Submit a registration and await the control task's verdict
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateConnection`] when a non-Offline record already
    /// exists for the `conn_id`; storage errors are treated as registration
    /// failure.
    pub async fn register(&self, client: &ClientHandle) -> Result<DatakitRecord> {
        let (ack, verdict) = oneshot::channel();
        self.register_tx
            .send(Registration {
                client: Arc::clone(client),
                ack,
            })
            .await
            .map_err(|_| Error::Config("registry control task stopped".to_string()))?;
        verdict
            .await
            .map_err(|_| Error::Config("registry control task stopped".to_string()))?
    }

    /// Submit an unregistration; processed asynchronously by the control task
    pub async fn unregister(&self, client: &ClientHandle) {
        let _ = self.unregister_tx.send(Arc::clone(client)).await;
    }

    /// Look up the live connection for a `conn_id`
    pub async fn lookup(&self, conn_id: &str) -> Option<ClientHandle> {
        let (reply, rx) = oneshot::channel();
        self.lookup_tx
            .send(Lookup {
                conn_id: conn_id.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Dispatch a named action to an agent and return its reply payload
    ///
    /// Actions are routed generically by name. Upgrade and restart carry a
    /// precondition: the agent's current status must permit a disruptive
    /// operation.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAction`] for unrecognized names,
    /// [`Error::DeviceUnavailable`] when no live connection exists, plus
    /// whatever the correlated request itself fails with.
    pub async fn action(&self, name: &str, conn_id: &str, data: Value) -> Result<Value> {
        if !actions::is_routed(name) {
            return Err(Error::UnknownAction(name.to_string()));
        }

        let client = self
            .lookup(conn_id)
            .await
            .ok_or_else(|| Error::DeviceUnavailable(conn_id.to_string()))?;

        if matches!(name, actions::UPGRADE_DATAKIT | actions::RESTART_DATAKIT) {
            self.check_disruptive_precondition(conn_id, name)?;
        }

        let reply = client.request(name, data).await?;
        Ok(reply.data)
    }

    /// Obtain a dedicated streaming socket from an agent
    ///
    /// # Errors
    ///
    /// [`Error::DeviceUnavailable`] when no live connection exists,
    /// [`Error::RequestTimeout`] when the agent never dials back.
    pub async fn open_secondary(&self, conn_id: &str, action: &str) -> Result<WebSocket> {
        if !actions::is_routed(action) {
            return Err(Error::UnknownAction(action.to_string()));
        }
        let client = self
            .lookup(conn_id)
            .await
            .ok_or_else(|| Error::DeviceUnavailable(conn_id.to_string()))?;
        self.secondary
            .open(&client, action, self.settings.secondary_timeout)
            .await
    }

    /// Hand an arriving secondary socket to the caller waiting on its token
    ///
    /// An unmatched `connect_id` is a logged drop, not an error: it usually
    /// means the waiting slot already timed out.
    pub async fn accept_secondary(&self, connect_id: &str, socket: WebSocket) {
        match self.secondary.deliver(connect_id, socket) {
            Ok(()) => {
                tracing::debug!(connect_id, "secondary connection delivered");
            }
            Err(mut socket) => {
                tracing::warn!(connect_id, "secondary connection with unknown connect_id");
                let _ = socket
                    .send(WsFrame::Close(Some(CloseFrame {
                        code: axum::extract::ws::close_code::POLICY,
                        reason: "unknown connect_id".into(),
                    })))
                    .await;
            }
        }
    }

    /// Run a freshly upgraded primary socket for its whole lifetime
    ///
    /// Registers the connection (closing the socket on rejection), spawns
    /// the write loop, drives the read loop, and deregisters on the way out.
    pub async fn run_connection(self: &Arc<Self>, socket: WebSocket, descriptor: DatakitDescriptor) {
        let (client, outbound_rx) = Client::new(
            descriptor,
            self.settings.send_timeout,
            self.settings.request_timeout,
        );
        let client: ClientHandle = Arc::new(client);

        match self.register(&client).await {
            Ok(record) => {
                tracing::info!(
                    conn_id = %record.conn_id,
                    workspace = %record.workspace_uuid,
                    host = %record.host_name,
                    "datakit registered"
                );
            }
            Err(e) => {
                tracing::warn!(conn_id = %client.conn_id(), error = %e, "registration rejected");
                let mut socket = socket;
                let _ = socket
                    .send(WsFrame::Close(Some(CloseFrame {
                        code: axum::extract::ws::close_code::POLICY,
                        reason: e.code().into(),
                    })))
                    .await;
                return;
            }
        }

        let (sink, stream) = socket.split();
        let writer = self
            .tracker
            .spawn(write_loop(sink, outbound_rx, client.cancel_token().clone()));

        self.read_loop(&client, stream).await;

        client.exit();
        self.unregister(&client).await;
        let _ = writer.await;
        tracing::info!(conn_id = %client.conn_id(), "datakit connection closed");
    }

    /// Read loop: demultiplexes every inbound frame for one connection
    ///
    /// Pushes are dispatched inline; replies are handed off to their pending
    /// slots without ever blocking on a slow caller. Any inbound frame bumps
    /// the heartbeat lease.
    async fn read_loop(&self, client: &ClientHandle, mut stream: SplitStream<WebSocket>) {
        loop {
            let next = tokio::select! {
                () = client.cancel_token().cancelled() => break,
                () = self.cancel.cancelled() => break,
                next = tokio::time::timeout(self.settings.read_idle_timeout, stream.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    tracing::warn!(
                        conn_id = %client.conn_id(),
                        idle = ?self.settings.read_idle_timeout,
                        "connection idle past heartbeat window"
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(conn_id = %client.conn_id(), error = %e, "socket error");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            if let Err(e) = self.repo.heartbeat(client.conn_id()) {
                tracing::warn!(conn_id = %client.conn_id(), error = %e, "heartbeat bump failed");
            }

            match frame {
                WsFrame::Text(text) => self.handle_frame(client, text.as_str()),
                WsFrame::Ping(_) | WsFrame::Pong(_) => {}
                WsFrame::Binary(data) => {
                    tracing::warn!(
                        conn_id = %client.conn_id(),
                        len = data.len(),
                        "unexpected binary frame on control channel"
                    );
                }
                WsFrame::Close(_) => break,
            }
        }
    }

    /// Decode one inbound text frame and route it
    ///
    /// Decode and dispatch failures are logged, never fatal to the loops.
    fn handle_frame(&self, client: &ClientHandle, raw: &str) {
        let msg: Message = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(conn_id = %client.conn_id(), error = %e, "undecodable frame");
                return;
            }
        };

        if msg.is_push() {
            self.dispatch_push(client, &msg);
        } else if !client.resolve_reply(msg.clone()) {
            tracing::warn!(
                conn_id = %client.conn_id(),
                id = msg.id,
                action = %msg.action,
                "reply dropped: no caller waiting"
            );
        }
    }

    /// Handle the reserved agent pushes
    fn dispatch_push(&self, client: &ClientHandle, msg: &Message) {
        let conn_id = client.conn_id();
        let outcome = match msg.action.as_str() {
            actions::UPDATE_DATAKIT_STATUS => msg
                .payload::<StatusUpdate>()
                .and_then(|update| self.apply_status_push(conn_id, &update.status)),
            actions::UPDATE_DATAKIT => msg
                .payload::<DatakitDescriptor>()
                .and_then(|descriptor| self.apply_record_push(conn_id, &descriptor)),
            actions::DELETE_DATAKIT => self.repo.purge(conn_id).map(|()| client.exit()),
            other => {
                tracing::warn!(conn_id, action = %other, "unknown push action");
                return;
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(conn_id, action = %msg.action, error = %e, "push rejected");
        }
    }

    fn apply_status_push(&self, conn_id: &str, status: &str) -> Result<()> {
        let to = DatakitStatus::parse(status)
            .ok_or_else(|| Error::ProtocolMismatch(format!("unknown status {status}")))?;
        self.repo.update_status(conn_id, to)
    }

    fn apply_record_push(&self, conn_id: &str, descriptor: &DatakitDescriptor) -> Result<()> {
        if descriptor.conn_id != conn_id {
            return Err(Error::ProtocolMismatch(format!(
                "update for {} pushed over connection {conn_id}",
                descriptor.conn_id
            )));
        }
        let status = self
            .repo
            .find(conn_id)?
            .map_or(DatakitStatus::Running, |record| record.status);
        self.repo
            .update(&DatakitRecord::from_descriptor(descriptor, status))
    }

    fn check_disruptive_precondition(&self, conn_id: &str, action: &str) -> Result<()> {
        let record = self
            .repo
            .find(conn_id)?
            .ok_or_else(|| Error::NotFound(conn_id.to_string()))?;
        if record.status.accepts_disruptive_ops() {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: record.status.as_str().to_string(),
                to: if action == actions::UPGRADE_DATAKIT {
                    DatakitStatus::Upgrading.as_str().to_string()
                } else {
                    DatakitStatus::Restarting.as_str().to_string()
                },
            })
        }
    }
}

/// Control task: sole owner of the live-connection map
async fn control_task(
    mut register_rx: mpsc::Receiver<Registration>,
    mut unregister_rx: mpsc::Receiver<ClientHandle>,
    mut lookup_rx: mpsc::Receiver<Lookup>,
    repo: DatakitRepo,
    live_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut live: HashMap<String, ClientHandle> = HashMap::new();

    loop {
        // Biased: registration events are consumed before lookups, so a
        // lookup submitted after an unregister always observes the removal.
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            Some(registration) = register_rx.recv() => {
                handle_register(&mut live, &repo, registration, &live_count);
            }
            Some(client) = unregister_rx.recv() => {
                handle_unregister(&mut live, &repo, &client, &live_count);
            }
            Some(lookup) = lookup_rx.recv() => {
                let _ = lookup.reply.send(live.get(&lookup.conn_id).cloned());
            }
            else => break,
        }
    }

    for client in live.values() {
        client.exit();
    }
    tracing::debug!("registry control task stopped");
}

fn handle_register(
    live: &mut HashMap<String, ClientHandle>,
    repo: &DatakitRepo,
    registration: Registration,
    live_count: &AtomicUsize,
) {
    let conn_id = registration.client.conn_id().to_string();

    let verdict = match repo.is_duplicate_connection(&conn_id) {
        Ok(true) => Err(Error::DuplicateConnection(conn_id.clone())),
        Ok(false) => {
            let record =
                DatakitRecord::from_descriptor(registration.client.descriptor(), DatakitStatus::Running);
            repo.replace(&record)
        }
        Err(e) => Err(e),
    };

    match verdict {
        Ok(record) => {
            if let Some(old) = live.insert(conn_id, Arc::clone(&registration.client)) {
                old.exit();
            }
            live_count.store(live.len(), Ordering::Relaxed);
            let _ = registration.ack.send(Ok(record));
        }
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, error = %e, "registration refused");
            let _ = registration.ack.send(Err(e));
        }
    }
}

fn handle_unregister(
    live: &mut HashMap<String, ClientHandle>,
    repo: &DatakitRepo,
    client: &ClientHandle,
    live_count: &AtomicUsize,
) {
    let conn_id = client.conn_id();
    client.exit();

    // Only the connection that owns the map entry may clean up the record;
    // a rejected duplicate must not soft-delete the live session's row.
    let owns_entry = live
        .get(conn_id)
        .is_some_and(|existing| Arc::ptr_eq(existing, client));
    if !owns_entry {
        return;
    }

    live.remove(conn_id);
    live_count.store(live.len(), Ordering::Relaxed);

    let outcome = if client.descriptor().run_in_container {
        repo.purge(conn_id)
    } else {
        repo.deregister(conn_id)
    };
    match outcome {
        Ok(()) | Err(Error::NotFound(_)) => {
            tracing::info!(conn_id, "datakit unregistered");
        }
        Err(e) => {
            tracing::error!(conn_id, error = %e, "record cleanup failed on unregister");
        }
    }
}

/// Payload of the `update_datakit_status` push
#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

/// Write loop: drains the send queue into the socket in FIFO order
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsFrame>,
    mut outbound: mpsc::Receiver<WsFrame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(WsFrame::Close(None)).await;
                break;
            }
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}
