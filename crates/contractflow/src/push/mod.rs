//! Push channel: one shared connection, job-scoped subscriptions on top.

pub mod frames;
pub mod retry;
pub mod transport;

pub use frames::{ClientFrame, JobEvent, ServerFrame};
pub use retry::ReconnectConfig;
pub use transport::{PushConnection, PushTransport, WsTransport};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::jobs::model::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub reconnect: ReconnectConfig,
    /// How long a subscription waits for the connection before sending its
    /// join signal anyway.
    pub join_wait: Duration,
    pub event_buffer: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            join_wait: Duration::from_secs(5),
            event_buffer: 1024,
        }
    }
}

struct Room {
    token: CancellationToken,
    joined: bool,
}

// Everything the background tasks need. Does not own the supervisor handle,
// so dropping the last PushClient can stop it.
struct Shared {
    transport: Arc<dyn PushTransport>,
    cfg: PushConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ServerFrame>,
    // lock order: rooms, then outbound
    rooms: Mutex<HashMap<JobId, Room>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
}

struct Inner {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

/// Connection manager for the push channel. Cheap to clone; clones share
/// the same connection.
#[derive(Clone)]
pub struct PushClient {
    inner: Arc<Inner>,
}

impl PushClient {
    pub fn new(transport: Arc<dyn PushTransport>, cfg: PushConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(cfg.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    transport,
                    cfg,
                    state,
                    events,
                    rooms: Mutex::new(HashMap::new()),
                    outbound: Mutex::new(None),
                }),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Starts the connection supervisor. No-op while one is already running.
    pub fn connect(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.inner.shared.set_state(ConnectionState::Connecting);
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner.shared))));
    }

    pub fn disconnect(&self) {
        if let Some(handle) = lock(&self.inner.supervisor).take() {
            handle.abort();
        }
        let shared = &self.inner.shared;
        for (_, room) in lock(&shared.rooms).drain() {
            room.token.cancel();
        }
        *lock(&shared.outbound) = None;
        shared.set_state(ConnectionState::Disconnected);
        tracing::info!("push channel closed");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Registers interest in one job. Events are buffered from this call
    /// onwards; the join signal itself is sent once the connection is up
    /// (or after the join wait, best-effort). Never blocks.
    pub fn subscribe_to_job(&self, job_id: &JobId) -> JobSubscription {
        let shared = &self.inner.shared;
        let events = shared.events.subscribe();
        let token = CancellationToken::new();

        let joined = {
            let mut rooms = lock(&shared.rooms);
            let joined = match rooms.remove(job_id) {
                Some(prev) => {
                    tracing::debug!(%job_id, "replacing existing job subscription");
                    prev.token.cancel();
                    prev.joined
                }
                None => false,
            };
            rooms.insert(
                job_id.clone(),
                Room {
                    token: token.clone(),
                    joined,
                },
            );
            joined
        };

        if !self.is_connected() {
            tracing::debug!(%job_id, "push channel not connected yet, connecting before join");
            self.connect();
        }
        if !joined {
            tokio::spawn(join_when_ready(
                Arc::clone(shared),
                job_id.clone(),
                token.clone(),
            ));
        }

        JobSubscription {
            job_id: job_id.clone(),
            events,
            token,
            client: self.clone(),
        }
    }

    /// Leaves the job's room and stops its subscription. Unknown job ids
    /// are ignored.
    pub fn unsubscribe_from_job(&self, job_id: &JobId) {
        self.inner.shared.release(job_id, None);
    }

    pub fn is_subscribed(&self, job_id: &JobId) -> bool {
        lock(&self.inner.shared.rooms).contains_key(job_id)
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn attach(&self, outbound: mpsc::UnboundedSender<ClientFrame>) {
        {
            let mut rooms = lock(&self.rooms);
            for (job_id, room) in rooms.iter_mut() {
                if outbound.send(ClientFrame::Subscribe(job_id.clone())).is_ok() {
                    room.joined = true;
                }
            }
            *lock(&self.outbound) = Some(outbound);
        }
        self.set_state(ConnectionState::Connected);
    }

    fn detach(&self) {
        *lock(&self.outbound) = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn join(&self, job_id: &JobId, token: &CancellationToken) {
        let mut rooms = lock(&self.rooms);
        if token.is_cancelled() {
            return;
        }
        let Some(room) = rooms.get_mut(job_id) else {
            return;
        };
        if room.joined {
            return;
        }
        match lock(&self.outbound).as_ref() {
            Some(tx) if tx.send(ClientFrame::Subscribe(job_id.clone())).is_ok() => {
                room.joined = true;
                tracing::debug!(%job_id, "joined job room");
            }
            _ => {
                tracing::debug!(%job_id, "no live push connection, room joins on reconnect");
            }
        }
    }

    // `owner` limits the release to one particular subscription handle.
    fn release(&self, job_id: &JobId, owner: Option<&CancellationToken>) {
        let mut rooms = lock(&self.rooms);
        if owner.is_some_and(|t| t.is_cancelled()) {
            return;
        }
        let Some(room) = rooms.remove(job_id) else {
            return;
        };
        room.token.cancel();
        if room.joined {
            if let Some(tx) = lock(&self.outbound).as_ref() {
                let _ = tx.send(ClientFrame::Unsubscribe(job_id.clone()));
            }
        }
        tracing::debug!(%job_id, "left job room");
    }
}

async fn supervise(shared: Arc<Shared>) {
    let mut rng = StdRng::from_entropy();
    let mut failures: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting);
        match shared.transport.open().await {
            Ok(PushConnection {
                outbound,
                mut inbound,
            }) => {
                failures = 0;
                shared.attach(outbound);
                tracing::info!("push channel connected");

                while let Some(frame) = inbound.recv().await {
                    // nobody listening is fine
                    let _ = shared.events.send(frame);
                }

                shared.detach();
                tracing::warn!("push channel disconnected");
            }
            Err(e) => {
                failures += 1;
                shared.set_state(ConnectionState::Disconnected);
                tracing::warn!(attempt = failures, error = %e, "push channel connection failed");
                if failures >= shared.cfg.reconnect.max_attempts {
                    tracing::error!(
                        attempts = failures,
                        "giving up on push channel; status polling still applies"
                    );
                    return;
                }
            }
        }

        let delay = retry::next_delay(failures.max(1), &shared.cfg.reconnect, &mut rng);
        tokio::time::sleep(delay).await;
    }
}

async fn join_when_ready(shared: Arc<Shared>, job_id: JobId, token: CancellationToken) {
    let mut state = shared.state.subscribe();
    let connected = async move {
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .is_ok()
    };

    tokio::select! {
        _ = token.cancelled() => return,
        res = tokio::time::timeout(shared.cfg.join_wait, connected) => {
            if res.is_err() {
                tracing::warn!(%job_id, "push channel still not connected, joining anyway");
            }
        }
    }

    shared.join(&job_id, &token);
}

/// Disposable handle for one job's push events. Dropping it (or calling
/// [`JobSubscription::close`]) leaves the job room.
pub struct JobSubscription {
    job_id: JobId,
    events: broadcast::Receiver<ServerFrame>,
    token: CancellationToken,
    client: PushClient,
}

impl JobSubscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Next event for this job; `None` once the subscription was released.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                msg = self.events.recv() => match msg {
                    Ok(frame) if frame.job_id() == &self.job_id => return Some(frame.into_event()),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(job_id = %self.job_id, skipped, "push subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Next event for this job that has already arrived, without waiting.
    pub fn try_next(&mut self) -> Option<JobEvent> {
        loop {
            match self.events.try_recv() {
                Ok(frame) if frame.job_id() == &self.job_id => return Some(frame.into_event()),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = %self.job_id, skipped, "push subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.client
            .inner
            .shared
            .release(&self.job_id, Some(&self.token));
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
