//! The dispatcher: a single serialized command stream that owns the
//! address→session registry.
//!
//! Every registration, unregistration, and delivery funnels through one
//! spawned task, so the registry is never touched by two writers at
//! once. Enqueues onto session queues are always `try_send`: a full
//! queue means a slow consumer, and slow consumers are evicted rather
//! than allowed to stall delivery to anyone else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{Address, Envelope, SessionId};

/// Dispatcher command queue capacity.
const COMMAND_CAPACITY: usize = 1024;

/// Tunables shared by the dispatcher and its sessions.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Per-session outbound queue capacity.
    pub outbound_capacity: usize,
    /// Interval between server-initiated Ping frames.
    pub ping_interval: Duration,
    /// Inbound silence after which a connection is reclaimed.
    pub idle_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            ping_interval: Duration::from_secs(54),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// A registered session as the dispatcher sees it: the enqueue side of
/// its outbound queue plus the token that tears it down.
pub(crate) struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) address: Address,
    pub(crate) outbound: mpsc::Sender<Arc<String>>,
    pub(crate) cancel: CancellationToken,
}

impl SessionHandle {
    /// Cancelling the token terminates both pumps and releases the
    /// transport. Idempotent.
    fn close(&self) {
        self.cancel.cancel();
    }
}

pub(crate) enum Command {
    Register(SessionHandle),
    Unregister {
        address: Address,
        session_id: SessionId,
    },
    Unicast {
        address: Address,
        envelope: Envelope,
    },
    Broadcast {
        envelope: Envelope,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Point-in-time snapshot of the registry. Not guaranteed consistent
/// with commands still in flight.
#[derive(Clone, Debug, Default, Serialize)]
pub struct HubStats {
    /// Number of live sessions.
    pub connected_clients: usize,
    /// Connected addresses, sorted.
    pub connected_users: Vec<Address>,
}

/// Cheap-clone handle to the dispatcher.
///
/// Delivery methods are fire-and-forget: they enqueue a command and
/// never report whether any recipient was online or reachable.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<Command>,
    config: HubConfig,
}

impl Hub {
    /// Spawn the dispatcher task and return a handle to it.
    ///
    /// The task exits once every `Hub` clone has been dropped.
    pub fn spawn(config: HubConfig) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let _ = tokio::spawn(Dispatcher::default().run(rx));
        Self { tx, config }
    }

    /// Session tunables, needed by the pumps.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Best-effort unicast to one address. Absent or slow recipients
    /// are invisible to the caller.
    pub async fn notify_user(
        &self,
        address: impl Into<Address>,
        kind: impl Into<String>,
        data: Value,
    ) {
        self.send(Command::Unicast {
            address: address.into(),
            envelope: Envelope::new(kind, data),
        })
        .await;
    }

    /// Best-effort fan-out to every live session.
    pub async fn broadcast_to_all(&self, kind: impl Into<String>, data: Value) {
        self.send(Command::Broadcast {
            envelope: Envelope::new(kind, data),
        })
        .await;
    }

    /// Snapshot the registry.
    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await;
        rx.await.unwrap_or_default()
    }

    pub(crate) async fn register(&self, handle: SessionHandle) {
        self.send(Command::Register(handle)).await;
    }

    pub(crate) async fn unregister(&self, address: Address, session_id: SessionId) {
        self.send(Command::Unregister {
            address,
            session_id,
        })
        .await;
    }

    async fn send(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            warn!("dispatcher is gone, dropping command");
        }
    }
}

/// Owns the registry. Only [`Dispatcher::run`] ever touches it.
#[derive(Default)]
struct Dispatcher {
    registry: HashMap<Address, SessionHandle>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("dispatcher started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register(handle) => self.register(handle),
                Command::Unregister {
                    address,
                    session_id,
                } => self.unregister(&address, &session_id),
                Command::Unicast { address, envelope } => self.unicast(&address, &envelope),
                Command::Broadcast { envelope } => self.broadcast(&envelope),
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
            }
        }
        debug!("command channel closed, dispatcher exiting");
    }

    /// Install a session, displacing any previous one for the address.
    fn register(&mut self, handle: SessionHandle) {
        if let Some(old) = self.registry.remove(&handle.address) {
            info!(address = %old.address, "session displaced by a newer connection");
            counter!("ws_evictions_total").increment(1);
            gauge!("ws_connections_active").decrement(1.0);
            old.close();
        }

        let address = handle.address.clone();
        let _ = self.registry.insert(address.clone(), handle);
        counter!("ws_connections_total").increment(1);
        gauge!("ws_connections_active").increment(1.0);
        info!(address = %address, total = self.registry.len(), "client connected");

        // The welcome message is the first item on a freshly created
        // queue, so this cannot saturate unless the session is already
        // unusable, in which case it is evicted on the spot.
        if let Some(wire) = serialize(&Envelope::connected(&address)) {
            if !self.try_deliver(&address, &wire) {
                self.evict(&address);
            }
        }
    }

    /// Remove a session, but only if it still owns its registry slot.
    fn unregister(&mut self, address: &Address, session_id: &SessionId) {
        match self.registry.get(address) {
            Some(handle) if handle.id == *session_id => {
                if let Some(handle) = self.registry.remove(address) {
                    handle.close();
                }
                counter!("ws_disconnections_total").increment(1);
                gauge!("ws_connections_active").decrement(1.0);
                info!(address = %address, total = self.registry.len(), "client disconnected");
            }
            // A teardown signal from a session that has already been
            // displaced must not evict its replacement.
            Some(_) => debug!(address = %address, "stale unregister ignored"),
            None => debug!(address = %address, "unregister for unknown address"),
        }
    }

    fn unicast(&mut self, address: &Address, envelope: &Envelope) {
        let Some(wire) = serialize(envelope) else {
            return;
        };
        if !self.registry.contains_key(address) {
            // Offline recipients are a silent no-op by contract.
            debug!(address = %address, kind = %envelope.kind, "unicast to absent address");
            return;
        }
        if self.try_deliver(address, &wire) {
            debug!(address = %address, kind = %envelope.kind, "unicast delivered");
        } else {
            self.evict(address);
        }
    }

    fn broadcast(&mut self, envelope: &Envelope) {
        let Some(wire) = serialize(envelope) else {
            return;
        };
        let mut saturated = Vec::new();
        for (address, handle) in &self.registry {
            if handle.outbound.try_send(Arc::clone(&wire)).is_err() {
                saturated.push(address.clone());
            }
        }
        debug!(
            kind = %envelope.kind,
            recipients = self.registry.len() - saturated.len(),
            "broadcast"
        );
        for address in saturated {
            self.evict(&address);
        }
    }

    fn stats(&self) -> HubStats {
        let mut users: Vec<Address> = self.registry.keys().cloned().collect();
        users.sort();
        HubStats {
            connected_clients: users.len(),
            connected_users: users,
        }
    }

    fn try_deliver(&self, address: &Address, wire: &Arc<String>) -> bool {
        self.registry
            .get(address)
            .is_some_and(|handle| handle.outbound.try_send(Arc::clone(wire)).is_ok())
    }

    /// Unilateral removal of a session whose queue cannot absorb a
    /// message. Inline map removal plus token cancel, never a blocking
    /// send back into the command stream.
    fn evict(&mut self, address: &Address) {
        if let Some(handle) = self.registry.remove(address) {
            warn!(address = %address, "outbound queue saturated, evicting session");
            counter!("ws_evictions_total").increment(1);
            counter!("ws_dropped_messages_total").increment(1);
            gauge!("ws_connections_active").decrement(1.0);
            handle.close();
        }
    }
}

/// Serialize once for all recipients of a delivery.
fn serialize(envelope: &Envelope) -> Option<Arc<String>> {
    match serde_json::to_string(envelope) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(kind = %envelope.kind, error = %e, "failed to serialize envelope");
            None
        }
    }
}
