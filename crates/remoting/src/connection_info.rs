//! Connection sharing cache
//!
//! One [`ConnectionInfo`] exists per [`ConnectionKey`]. It de-duplicates
//! concurrent connection attempts and decides, once per physical connection,
//! whether several credentials may share it:
//!
//! ```text
//!            connect                 remote auth
//!   None ──────────────► MaybeShared ─────────────► Shared
//!    ▲                       │  │      no remote auth
//!    │   attempt failed      │  └──────────────────► NotShared
//!    └───────────────────────┘
//! ```
//!
//! Every transition is decided and committed under the state lock; provider
//! calls run after the lock is released against the placeholder results the
//! commit installed.
//!
//! Callers never see an attempt's result directly. Each gets its own claim,
//! and the provider connect is cancelled once every claim on the attempt has
//! been cancelled. A closed connection leaves the state as soon as its close
//! handlers run. An entry that falls back to `None` is retired and dropped
//! from the endpoint's table.

use crate::closeable::HandleableCloseable;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{RemotingError, Result};
use crate::future::{FutureResult, IoFuture, Status};
use crate::sasl::AuthenticationConfiguration;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;
use url::Url;

/// Cache key: destination authority plus the TLS context name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    authority: String,
    ssl_context: Option<String>,
}

impl ConnectionKey {
    /// Key for `destination` under the named TLS context
    pub fn new(destination: &Url, ssl_context: Option<&str>) -> Self {
        let mut authority = format!("{}:", destination.scheme());
        match destination.host_str() {
            Some(host) => {
                authority.push_str("//");
                authority.push_str(host);
                if let Some(port) = destination.port_or_known_default() {
                    authority.push_str(&format!(":{port}"));
                }
            }
            None => authority.push_str(destination.path()),
        }
        Self {
            authority,
            ssl_context: ssl_context.map(str::to_string),
        }
    }

    /// `scheme://host:port` form of the destination
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// TLS context name
    pub fn ssl_context(&self) -> Option<&str> {
        self.ssl_context.as_deref()
    }
}

/// Public view of the sharing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// No connection and no attempt
    None,
    /// First attempt in flight; sharing not yet known
    MaybeShared,
    /// One connection serves every credential
    Shared,
    /// One connection per credential
    NotShared,
}

#[derive(Default)]
struct Interest {
    claims: usize,
    abandoned: bool,
}

/// A connection result that several callers may wait on
#[derive(Clone)]
struct Slot {
    result: FutureResult<Arc<Connection>>,
    interest: Arc<Mutex<Interest>>,
}

impl Slot {
    fn new(result: FutureResult<Arc<Connection>>) -> Self {
        Self {
            result,
            interest: Arc::new(Mutex::new(Interest::default())),
        }
    }

    /// A pending result that only its claims can cancel
    fn waiter() -> Self {
        let slot = Self::new(FutureResult::new());
        let canceller = slot.result.clone();
        slot.result.add_cancel_handler(move || {
            canceller.set_cancelled();
        });
        slot
    }

    fn resolved(connection: Arc<Connection>) -> Self {
        let slot = Self::new(FutureResult::new());
        slot.result.set_result(connection);
        slot
    }

    fn future(&self) -> IoFuture<Arc<Connection>> {
        self.result.future()
    }

    fn holds_closed_connection(&self) -> bool {
        matches!(self.future().status(), Status::Done(connection) if !connection.is_open())
    }

    /// A caller's own view of the result, or `None` if the slot can no
    /// longer produce a usable connection
    fn claim(&self) -> Option<IoFuture<Arc<Connection>>> {
        let source = self.future();
        match source.status() {
            Status::Waiting => {}
            Status::Done(connection) if connection.is_open() => return Some(source),
            _ => return None,
        }
        {
            let mut interest = self.interest.lock();
            if interest.abandoned {
                return None;
            }
            interest.claims += 1;
        }
        let claim = FutureResult::new();
        claim.follow(&source);
        let canceller = claim.clone();
        let interest = Arc::clone(&self.interest);
        claim.add_cancel_handler(move || {
            canceller.set_cancelled();
            let last = {
                let mut interest = interest.lock();
                interest.claims = interest.claims.saturating_sub(1);
                interest.abandoned = interest.claims == 0;
                interest.abandoned
            };
            if last {
                source.cancel();
            }
        });
        Some(claim.future())
    }
}

struct Attempt {
    serial: u64,
    config: AuthenticationConfiguration,
    slot: Slot,
    pending: IndexMap<AuthenticationConfiguration, Slot>,
    settled: watch::Sender<bool>,
}

enum State {
    None,
    MaybeShared(Attempt),
    Shared {
        connection: Arc<Connection>,
    },
    NotShared {
        connections: HashMap<AuthenticationConfiguration, Slot>,
    },
    /// Dropped from the endpoint's table; callers look the key up again
    Retired,
}

impl State {
    fn sharing(&self) -> Sharing {
        match self {
            Self::None | Self::Retired => Sharing::None,
            Self::MaybeShared(_) => Sharing::MaybeShared,
            Self::Shared { .. } => Sharing::Shared,
            Self::NotShared { .. } => Sharing::NotShared,
        }
    }

    /// Drop connections that have closed but whose close handler has not run
    fn discard_closed(&mut self) {
        match self {
            Self::Shared { connection } if !connection.is_open() => *self = Self::None,
            Self::NotShared { connections } => {
                connections.retain(|_, slot| !slot.holds_closed_connection());
                if connections.is_empty() {
                    *self = Self::None;
                }
            }
            _ => {}
        }
    }
}

/// Outcome of a sharing cache lookup
pub(crate) enum Lookup {
    Found(IoFuture<Arc<Connection>>),
    Absent,
    Retired,
}

enum Action {
    Ready(IoFuture<Arc<Connection>>),
    Absent,
    Retired,
    Connect {
        result: FutureResult<Arc<Connection>>,
        claim: IoFuture<Arc<Connection>>,
        attempt: Option<u64>,
    },
}

enum Settle {
    Share(Arc<Connection>, Vec<Slot>),
    Separate {
        connection: Arc<Connection>,
        own: Vec<Slot>,
        replays: Vec<(AuthenticationConfiguration, Slot)>,
    },
    Replay(Vec<(AuthenticationConfiguration, Slot)>),
}

enum ClosedStep {
    Clear,
    Prune,
    Wait(watch::Receiver<bool>),
    Ignore,
}

/// Sharing state machine for one destination
pub struct ConnectionInfo {
    key: ConnectionKey,
    destination: Url,
    endpoint: Weak<Endpoint>,
    state: Mutex<State>,
    next_attempt: AtomicU64,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("key", &self.key)
            .field("sharing", &self.sharing())
            .finish()
    }
}

fn is_connection(status: &Status<Arc<Connection>>, serial: u64) -> bool {
    matches!(status, Status::Done(connection) if connection.serial() == serial)
}

fn fresh_claim(slot: &Slot) -> IoFuture<Arc<Connection>> {
    slot.claim().unwrap_or_else(|| slot.future())
}

impl ConnectionInfo {
    pub(crate) fn new(key: ConnectionKey, destination: Url, endpoint: Weak<Endpoint>) -> Arc<Self> {
        Arc::new(Self {
            key,
            destination,
            endpoint,
            state: Mutex::new(State::None),
            next_attempt: AtomicU64::new(1),
        })
    }

    /// Cache key
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Momentary sharing state
    pub fn sharing(&self) -> Sharing {
        self.state.lock().sharing()
    }

    /// Connection future for `config`.
    ///
    /// With `do_connect` false this only peeks: `Absent` means nothing
    /// usable exists for the credential yet. With `do_connect` true an
    /// attempt is in flight or finished unless the entry was retired.
    pub(crate) fn get_connection(self: &Arc<Self>, config: &AuthenticationConfiguration, do_connect: bool) -> Lookup {
        let action = {
            let mut state = self.state.lock();
            state.discard_closed();
            match &mut *state {
                State::Retired => Action::Retired,
                State::None if !do_connect => Action::Absent,
                State::None => {
                    let slot = Slot::new(FutureResult::new());
                    let claim = fresh_claim(&slot);
                    let serial = self.next_attempt.fetch_add(1, Ordering::Relaxed);
                    let (settled, _) = watch::channel(false);
                    let result = slot.result.clone();
                    *state = State::MaybeShared(Attempt {
                        serial,
                        config: config.clone(),
                        slot,
                        pending: IndexMap::new(),
                        settled,
                    });
                    debug!(destination = %self.key.authority, attempt = serial, "first connection attempt");
                    Action::Connect {
                        result,
                        claim,
                        attempt: Some(serial),
                    }
                }
                State::MaybeShared(attempt) => {
                    let claimed = if attempt.config == *config {
                        attempt.slot.claim()
                    } else {
                        attempt.pending.get(config).and_then(Slot::claim)
                    };
                    match claimed {
                        Some(claim) => Action::Ready(claim),
                        None if !do_connect => Action::Absent,
                        None => {
                            // Also covers the attempt's own credential once
                            // every caller abandoned it.
                            let waiter = Slot::waiter();
                            let claim = fresh_claim(&waiter);
                            attempt.pending.insert(config.clone(), waiter);
                            Action::Ready(claim)
                        }
                    }
                }
                State::Shared { connection } => Action::Ready(IoFuture::done(Arc::clone(connection))),
                State::NotShared { connections } => match connections.get(config).and_then(Slot::claim) {
                    Some(claim) => Action::Ready(claim),
                    None if !do_connect => Action::Absent,
                    None => {
                        let slot = Slot::new(FutureResult::new());
                        let claim = fresh_claim(&slot);
                        let result = slot.result.clone();
                        connections.insert(config.clone(), slot);
                        Action::Connect {
                            result,
                            claim,
                            attempt: None,
                        }
                    }
                },
            }
        };

        match action {
            Action::Ready(future) => Lookup::Found(future),
            Action::Absent => Lookup::Absent,
            Action::Retired => Lookup::Retired,
            Action::Connect { result, claim, attempt } => {
                self.start_connect(config.clone(), result, attempt);
                Lookup::Found(claim)
            }
        }
    }

    fn start_connect(
        self: &Arc<Self>,
        config: AuthenticationConfiguration,
        result: FutureResult<Arc<Connection>>,
        attempt: Option<u64>,
    ) {
        let connect = match self.endpoint.upgrade() {
            Some(endpoint) => endpoint.connect_unshared(
                &self.destination,
                &config,
                self.key.ssl_context.clone(),
                None,
            ),
            None => IoFuture::failed(RemotingError::not_open("endpoint is gone")),
        };
        // The transition commits before the caller's result completes.
        let info = Arc::clone(self);
        let target = result.future();
        connect.add_notifier(move |status| match attempt {
            Some(serial) => info.shared_attempt_finished(serial, status),
            None => info.unshared_attempt_finished(&config, &target, status),
        });
        result.pipe_from(&connect);
    }

    /// Start over for `config` after the attempt it waited on failed
    fn reconnect(self: &Arc<Self>, config: &AuthenticationConfiguration) -> Option<IoFuture<Arc<Connection>>> {
        match self.get_connection(config, true) {
            Lookup::Found(future) => Some(future),
            Lookup::Absent => None,
            Lookup::Retired => {
                let endpoint = self.endpoint.upgrade()?;
                endpoint.connection_future(&self.destination, self.key.ssl_context(), config, true)
            }
        }
    }

    fn shared_attempt_finished(self: &Arc<Self>, serial: u64, status: &Status<Arc<Connection>>) {
        let (settle, settled) = {
            let mut state = self.state.lock();
            let attempt = match std::mem::replace(&mut *state, State::None) {
                State::MaybeShared(attempt) if attempt.serial == serial => attempt,
                other => {
                    *state = other;
                    return;
                }
            };
            let Attempt {
                config,
                pending,
                settled,
                ..
            } = attempt;
            let settle = match status {
                Status::Done(connection) if connection.supports_remote_auth() => {
                    *state = State::Shared {
                        connection: Arc::clone(connection),
                    };
                    Settle::Share(Arc::clone(connection), pending.into_values().collect())
                }
                Status::Done(connection) => {
                    let mut connections = HashMap::new();
                    let mut replays = Vec::new();
                    let mut own = Vec::new();
                    for (pending_config, waiter) in pending {
                        if !waiter.future().status().is_waiting() {
                            continue;
                        }
                        if pending_config == config {
                            own.push(waiter);
                        } else {
                            connections.insert(pending_config.clone(), waiter.clone());
                            replays.push((pending_config, waiter));
                        }
                    }
                    connections.insert(config, Slot::resolved(Arc::clone(connection)));
                    *state = State::NotShared { connections };
                    Settle::Separate {
                        connection: Arc::clone(connection),
                        own,
                        replays,
                    }
                }
                _ => Settle::Replay(pending.into_iter().collect()),
            };
            debug!(
                destination = %self.key.authority,
                attempt = serial,
                sharing = ?state.sharing(),
                "connection attempt settled"
            );
            (settle, settled)
        };
        settled.send_replace(true);

        match settle {
            Settle::Share(connection, waiters) => {
                self.watch_connection(&connection);
                for waiter in waiters {
                    waiter.result.set_result(Arc::clone(&connection));
                }
            }
            Settle::Separate {
                connection,
                own,
                replays,
            } => {
                self.watch_connection(&connection);
                for waiter in own {
                    waiter.result.set_result(Arc::clone(&connection));
                }
                for (config, waiter) in replays {
                    self.start_connect(config, waiter.result, None);
                }
            }
            Settle::Replay(waiters) => {
                for (config, waiter) in waiters {
                    if !waiter.future().status().is_waiting() {
                        continue;
                    }
                    match self.reconnect(&config) {
                        Some(future) => waiter.result.pipe_from(&future),
                        None => {
                            waiter
                                .result
                                .set_exception(RemotingError::illegal_state("connection replay produced no attempt"));
                        }
                    }
                }
                self.retire_if_idle();
            }
        }
    }

    fn unshared_attempt_finished(
        self: &Arc<Self>,
        config: &AuthenticationConfiguration,
        target: &IoFuture<Arc<Connection>>,
        status: &Status<Arc<Connection>>,
    ) {
        if let Status::Done(connection) = status {
            self.watch_connection(connection);
            return;
        }
        {
            let mut state = self.state.lock();
            if let State::NotShared { connections } = &mut *state {
                if connections.get(config).is_some_and(|cached| cached.future().ptr_eq(target)) {
                    connections.remove(config);
                }
                if connections.is_empty() {
                    *state = State::None;
                }
            }
        }
        self.retire_if_idle();
    }

    fn watch_connection(self: &Arc<Self>, connection: &Arc<Connection>) {
        let info = Arc::downgrade(self);
        let serial = connection.serial();
        let executor = connection.close_tracker().executor().clone();
        connection.close_tracker().add_close_handler(move |_| {
            let Some(info) = info.upgrade() else {
                return;
            };
            if let Some(settled) = info.forget_connection(serial) {
                executor.spawn(async move {
                    info.connection_closed(serial, settled).await;
                });
            }
        });
    }

    /// Remove the closed connection `serial` from the state.
    ///
    /// Returns the attempt's settled signal when the attempt that produced
    /// the connection has not committed its transition yet.
    fn forget_connection(self: &Arc<Self>, serial: u64) -> Option<watch::Receiver<bool>> {
        let step = {
            let mut state = self.state.lock();
            let step = match &*state {
                State::Shared { connection } if connection.serial() == serial => ClosedStep::Clear,
                State::NotShared { .. } => ClosedStep::Prune,
                State::MaybeShared(attempt) if is_connection(&attempt.slot.future().status(), serial) => {
                    ClosedStep::Wait(attempt.settled.subscribe())
                }
                _ => ClosedStep::Ignore,
            };
            match step {
                ClosedStep::Clear => *state = State::None,
                ClosedStep::Prune => {
                    if let State::NotShared { connections } = &mut *state {
                        connections.retain(|_, cached| !is_connection(&cached.future().status(), serial));
                        if connections.is_empty() {
                            *state = State::None;
                        }
                    }
                }
                ClosedStep::Wait(_) | ClosedStep::Ignore => {}
            }
            step
        };
        match step {
            ClosedStep::Wait(settled) => Some(settled),
            ClosedStep::Clear | ClosedStep::Prune => {
                debug!(destination = %self.key.authority, connection = serial, "connection closed");
                self.retire_if_idle();
                None
            }
            ClosedStep::Ignore => None,
        }
    }

    /// Forget the connection with `serial` once its attempt has settled
    async fn connection_closed(self: Arc<Self>, serial: u64, mut settled: watch::Receiver<bool>) {
        loop {
            let _ = settled.wait_for(|done| *done).await;
            match self.forget_connection(serial) {
                Some(next) => settled = next,
                None => return,
            }
        }
    }

    fn retire_if_idle(self: &Arc<Self>) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.retire_connection_info(self);
        }
    }

    /// Mark an idle entry retired; `false` if it is in use
    pub(crate) fn retire(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, State::None) {
            *state = State::Retired;
            debug!(destination = %self.key.authority, "retiring idle entry");
            true
        } else {
            false
        }
    }
}

/// Resolve a connection future, failing with `IllegalState` on a peek miss
pub(crate) fn require(future: Option<IoFuture<Arc<Connection>>>) -> Result<IoFuture<Arc<Connection>>> {
    future.ok_or_else(|| RemotingError::illegal_state("no connection attempt was started"))
}
