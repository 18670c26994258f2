//! Set of logged-in sessions and the fan-out over them.
//!
//! Members are identified by a monotonically increasing [`SessionId`] and kept
//! in join order. Each member owns a bounded outbox; the registry never touches
//! sockets, it only enqueues encoded lines. Whoever holds the matching
//! [`Registration`] drains the outbox onto the connection.
//!
//! A full outbox pushes back on the sender: fan-out waits for room, up to the
//! send timeout, before giving up on that one member.
//!
//! The member map sits behind a `std::sync::Mutex` that is only held for a
//! single lookup or mutation and never across an `.await`.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, warn};

use crate::message::{Login, Msg};

pub type SessionId = u64;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Registry {
    members: Mutex<BTreeMap<SessionId, Member>>,
    next_id: AtomicU64,
    outbox_capacity: usize,
    send_timeout: Duration,
}

struct Member {
    user: Arc<str>,
    outbox: mpsc::Sender<Bytes>,
}

/// Outcome of one [`Registry::broadcast_to_all`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub evicted: Vec<SessionId>,
}

impl Registry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            members: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            // A zero-capacity mpsc channel panics; one slot is the floor.
            outbox_capacity: outbox_capacity.max(1),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// How long fan-out waits for room in a full outbox before evicting.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Adds an authenticated session. Usernames are not required to be unique.
    ///
    /// The returned handle unregisters the member when dropped.
    pub fn register(self: &Arc<Self>, login: &Login) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let user: Arc<str> = Arc::from(login.user.as_str());
        let (outbox, inbox) = mpsc::channel(self.outbox_capacity);

        self.lock().insert(
            id,
            Member {
                user: Arc::clone(&user),
                outbox,
            },
        );
        debug!(session = id, %user, "registered");

        Registration {
            id,
            user,
            inbox,
            registry: Arc::clone(self),
        }
    }

    /// Removes a member. Returns `false` if it was already gone.
    pub fn unregister(&self, id: SessionId) -> bool {
        let removed = self.lock().remove(&id);
        if let Some(member) = &removed {
            debug!(session = id, user = %member.user, "unregistered");
        }
        removed.is_some()
    }

    /// Encodes `msg` once and queues it for every current member.
    ///
    /// Membership is snapshotted under the lock and delivery happens after it
    /// is released, concurrently for all recipients. A member whose outbox
    /// stays full for the whole send timeout, or is closed, is evicted without
    /// affecting delivery to the others. Until then the caller waits, which
    /// throttles a sender to the pace of its slowest live reader.
    pub async fn broadcast_to_all(&self, msg: &Msg) -> Delivery {
        let line = Bytes::from(msg.encode());
        let recipients: Vec<(SessionId, Arc<str>, mpsc::Sender<Bytes>)> = self
            .lock()
            .iter()
            .map(|(id, member)| (*id, Arc::clone(&member.user), member.outbox.clone()))
            .collect();

        let send_timeout = self.send_timeout;
        let sends = recipients.into_iter().map(|(id, user, outbox)| {
            let line = line.clone();
            async move { (id, user, outbox.send_timeout(line, send_timeout).await) }
        });

        let mut delivery = Delivery::default();
        for (id, user, result) in join_all(sends).await {
            match result {
                Ok(()) => delivery.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(session = id, %user, "outbox stayed full, evicting slow client");
                    delivery.evicted.push(id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(session = id, %user, "outbox closed during fan-out");
                    delivery.evicted.push(id);
                }
            }
        }

        for id in &delivery.evicted {
            self.unregister(*id);
        }

        delivery
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current members as `(id, user)` in join order.
    pub fn members(&self) -> Vec<(SessionId, String)> {
        self.lock()
            .iter()
            .map(|(id, member)| (*id, member.user.to_string()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SessionId, Member>> {
        // The map is consistent after every single insert/remove, so a
        // poisoned lock is still safe to use.
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}

/// A live registry membership.
///
/// Yields the lines fanned out to this member and removes it from the
/// registry when dropped.
pub struct Registration {
    id: SessionId,
    user: Arc<str>,
    inbox: mpsc::Receiver<Bytes>,
    registry: Arc<Registry>,
}

impl Registration {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Next queued line. `None` once the registry dropped this member.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbox.recv().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
