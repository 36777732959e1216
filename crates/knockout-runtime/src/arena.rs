//! Shared game state of one server process and its public entry points.
//!
//! The arena owns the collaborators (session store, question bank, name
//! directory), the membership registry, the notification channel, the lobby
//! trackers and the per-session actors. Transport code only talks to the
//! methods at the bottom of this file.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use knockout_core::rules::AnswerSubmission;
use knockout_core::{
    ConnectionId, GameConfig, Identity, IdentityId, KnockoutError, LobbyTracker,
    MembershipRegistry, MembershipUpdate, NameDirectory, QuestionSource, ServerEvent, Session,
    SessionId, SessionStore, StoreError, WinnerInfo,
};

use crate::lobby;
use crate::notify::Notifier;
use crate::round::{self, SessionCommand};

/// First backoff step between store retries; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock timestamps derived from tokio's monotonic clock.
///
/// Anchored once at construction so persisted timestamps and timer delays
/// agree, including under a paused test clock.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_utc: DateTime<Utc>,
    base_instant: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            base_utc: Utc::now(),
            base_instant: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.base_instant);
        self.base_utc + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StoreHandle
// ---------------------------------------------------------------------------

/// Serialized access to the session store with bounded retries.
pub struct StoreHandle {
    inner: Mutex<Box<dyn SessionStore>>,
    attempts: u32,
}

impl StoreHandle {
    pub fn new(store: Box<dyn SessionStore>, attempts: u32) -> Self {
        Self {
            inner: Mutex::new(store),
            attempts: attempts.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn SessionStore>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `op` against the store, retrying backend failures with
    /// exponential backoff. `op` may be invoked more than once.
    pub async fn run<T, F>(&self, what: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut dyn SessionStore) -> Result<T, StoreError>,
    {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let result = {
                let mut store = self.lock();
                op(&mut **store)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(op = what, attempt, error = %e, "store write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!(op = what, attempt, error = %e, "store operation failed");
                    return Err(e);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

/// What a `join_waiting_room` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Added to (or already in) the open waiting room.
    Waiting {
        session_id: SessionId,
        join_code: String,
        update: MembershipUpdate,
    },
    /// The identity already plays in a running session; its state was resent.
    Rejoined { session_id: SessionId },
}

/// A live client attachment returned by [`Arena::connect`].
pub struct ClientHandle {
    pub connection: ConnectionId,
    pub events: mpsc::Receiver<ServerEvent>,
}

pub struct Arena {
    config: GameConfig,
    clock: Clock,
    store: StoreHandle,
    questions: Arc<dyn QuestionSource>,
    names: Arc<dyn NameDirectory>,
    registry: MembershipRegistry,
    notifier: Notifier,
    /// Lobby trackers of waiting sessions. Held across a whole join or
    /// countdown step so lobby transitions are serialized.
    pub(crate) lobby: tokio::sync::Mutex<HashMap<SessionId, LobbyTracker>>,
    actors: Mutex<HashMap<SessionId, mpsc::Sender<SessionCommand>>>,
    cancel: CancellationToken,
}

impl Arena {
    pub fn new(
        config: GameConfig,
        store: Box<dyn SessionStore>,
        questions: Arc<dyn QuestionSource>,
        names: Arc<dyn NameDirectory>,
    ) -> Arc<Self> {
        Self::with_clock(config, store, questions, names, Clock::new())
    }

    /// Create an arena reading time from `clock`. Arenas sharing a clock
    /// agree on timestamps, which a restart over the same database relies on.
    pub fn with_clock(
        config: GameConfig,
        store: Box<dyn SessionStore>,
        questions: Arc<dyn QuestionSource>,
        names: Arc<dyn NameDirectory>,
        clock: Clock,
    ) -> Arc<Self> {
        let attempts = config.persistence_retries;
        Arc::new(Self {
            config,
            clock,
            store: StoreHandle::new(store, attempts),
            questions,
            names,
            registry: MembershipRegistry::new(),
            notifier: Notifier::new(),
            lobby: tokio::sync::Mutex::new(HashMap::new()),
            actors: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn questions(&self) -> &dyn QuestionSource {
        self.questions.as_ref()
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn winner_info(&self, identity: &IdentityId) -> WinnerInfo {
        WinnerInfo {
            id: identity.clone(),
            display_name: self.names.display_name_or_id(identity),
        }
    }

    // ---- actors ----------------------------------------------------------

    pub(crate) fn register_actor(&self, session_id: SessionId, tx: mpsc::Sender<SessionCommand>) {
        self.actors_lock().insert(session_id, tx);
    }

    pub(crate) fn unregister_actor(&self, session_id: SessionId) {
        self.actors_lock().remove(&session_id);
    }

    fn actors_lock(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::Sender<SessionCommand>>> {
        self.actors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn actor(&self, session_id: SessionId) -> Option<mpsc::Sender<SessionCommand>> {
        self.actors_lock().get(&session_id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.actors_lock().keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) async fn send_to_actor(&self, session_id: SessionId, cmd: SessionCommand) -> bool {
        let Some(tx) = self.actor(session_id) else {
            return false;
        };
        tx.send(cmd).await.is_ok()
    }

    /// Spawn a background task whose panic is logged and contained.
    pub(crate) fn spawn_task<F>(&self, task: &'static str, session_id: SessionId, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(task, session_id = %session_id, "background task panicked");
                }
            }
        });
    }

    // ---- public entry points ----------------------------------------------

    /// Rehydrate every running session after a restart.
    ///
    /// Stored connection handles died with the previous process and are
    /// cleared first. Returns the recovered session ids.
    pub async fn recover(self: &Arc<Self>) -> Result<Vec<SessionId>, StoreError> {
        let cleared = self
            .store
            .run("clear_connections", |s| s.clear_connections())
            .await?;
        let running = self.store.run("list_running", |s| s.list_running()).await?;
        for id in &running {
            round::spawn_session(self, *id);
        }
        info!(sessions = running.len(), cleared_connections = cleared, "recovery complete");
        Ok(running)
    }

    /// Attach a verified identity's live connection.
    ///
    /// If the identity plays in a running session, its current state is
    /// resent through the session actor.
    pub async fn connect(self: &Arc<Self>, identity: &Identity) -> ClientHandle {
        let (connection, events) = self.notifier.register(&identity.id);
        debug!(identity = %identity.id, connection = %connection, "client connected");
        if let Err(e) = self.resume_running(&identity.id, connection).await {
            warn!(identity = %identity.id, error = %e, "could not look up running session");
        }
        ClientHandle { connection, events }
    }

    /// Detach a connection. Leaves every waiting room and clears the live
    /// handle in a running session; never eliminates.
    pub async fn disconnect(self: &Arc<Self>, connection: ConnectionId) {
        let Some(identity) = self.notifier.unregister(connection) else {
            debug!(connection = %connection, "superseded connection closed");
            return;
        };
        debug!(identity = %identity, connection = %connection, "client disconnected");
        lobby::leave_waiting_room(self, &identity).await;

        match self
            .store
            .run("find_running_for_identity", |s| s.find_running_for_identity(&identity))
            .await
        {
            Ok(Some(session)) => {
                self.send_to_actor(session.id, SessionCommand::Disconnect {
                    identity,
                    connection,
                })
                .await;
            }
            Ok(None) => {}
            Err(e) => warn!(identity = %identity, error = %e, "disconnect lookup failed"),
        }
    }

    pub async fn join_waiting_room(
        self: &Arc<Self>,
        identity: &Identity,
    ) -> Result<JoinOutcome, KnockoutError> {
        if let Some(connection) = self.notifier.connection_of(&identity.id) {
            if let Some(session_id) = self.resume_running(&identity.id, connection).await? {
                return Ok(JoinOutcome::Rejoined { session_id });
            }
        }
        lobby::join_waiting_room(self, identity).await
    }

    pub async fn leave_waiting_room(self: &Arc<Self>, identity: &Identity) -> Vec<MembershipUpdate> {
        lobby::leave_waiting_room(self, &identity.id).await
    }

    /// Hand an answer to its session actor. Validation happens there; a
    /// submission for a session without an actor is stale and dropped.
    pub async fn submit_answer(
        self: &Arc<Self>,
        identity: &Identity,
        submission: AnswerSubmission,
    ) -> Result<(), KnockoutError> {
        let session_id = submission.session_id;
        let cmd = SessionCommand::Answer {
            identity: identity.id.clone(),
            submission,
            received_at: self.now(),
        };
        if self.send_to_actor(session_id, cmd).await {
            Ok(())
        } else {
            debug!(identity = %identity.id, session_id = %session_id, "answer for inactive session dropped");
            Err(KnockoutError::StaleOrMismatchedRound { open: None })
        }
    }

    /// Durable view of a session.
    pub async fn session(&self, id: SessionId) -> Result<Session, StoreError> {
        self.store.run("load_session", |s| s.load_session(id)).await
    }

    async fn resume_running(
        self: &Arc<Self>,
        identity: &IdentityId,
        connection: ConnectionId,
    ) -> Result<Option<SessionId>, StoreError> {
        let running = self
            .store
            .run("find_running_for_identity", |s| s.find_running_for_identity(identity))
            .await?;
        let Some(session) = running else {
            return Ok(None);
        };
        self.notifier.subscribe(session.id, identity);
        self.send_to_actor(session.id, SessionCommand::Reconnect {
            identity: identity.clone(),
            connection,
        })
        .await;
        Ok(Some(session.id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use knockout_core::collab::WaitingSlot;
    use knockout_core::rules::RoundResolution;
    use knockout_core::{AnswerRecord, Capacity, Question, RoundId, SessionPlayer};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails every call until `failures` is exhausted.
    struct Flaky {
        failures: AtomicU32,
        error: StoreError,
    }

    impl Flaky {
        fn fail(&self) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    impl SessionStore for Flaky {
        fn create_waiting(&mut self, _: &str, _: Capacity, _: DateTime<Utc>) -> Result<WaitingSlot, StoreError> {
            unimplemented!()
        }
        fn find_open_waiting(&self) -> Result<Option<Session>, StoreError> {
            unimplemented!()
        }
        fn find_running_for_identity(&self, _: &IdentityId) -> Result<Option<Session>, StoreError> {
            unimplemented!()
        }
        fn load_session(&self, _: SessionId) -> Result<Session, StoreError> {
            unimplemented!()
        }
        fn list_running(&self) -> Result<Vec<SessionId>, StoreError> {
            self.fail()?;
            Ok(vec![SessionId(1)])
        }
        fn start_session(&mut self, _: SessionId, _: &[SessionPlayer], _: DateTime<Utc>) -> Result<bool, StoreError> {
            unimplemented!()
        }
        fn append_round(&mut self, _: SessionId, _: &Question, _: DateTime<Utc>) -> Result<Option<RoundId>, StoreError> {
            unimplemented!()
        }
        fn record_answer(&mut self, _: RoundId, _: &AnswerRecord) -> Result<bool, StoreError> {
            unimplemented!()
        }
        fn close_round_if_open(&mut self, _: RoundId, _: DateTime<Utc>, _: &RoundResolution) -> Result<bool, StoreError> {
            unimplemented!()
        }
        fn mark_eliminated(&mut self, _: SessionId, _: &IdentityId) -> Result<bool, StoreError> {
            unimplemented!()
        }
        fn set_connection(&mut self, _: SessionId, _: &IdentityId, _: Option<ConnectionId>) -> Result<bool, StoreError> {
            unimplemented!()
        }
        fn clear_connections(&mut self) -> Result<usize, StoreError> {
            unimplemented!()
        }
        fn finalize(&mut self, _: SessionId, _: Option<&IdentityId>, _: DateTime<Utc>) -> Result<bool, StoreError> {
            unimplemented!()
        }
    }

    fn flaky(failures: u32, error: StoreError) -> Box<dyn SessionStore> {
        Box::new(Flaky {
            failures: AtomicU32::new(failures),
            error,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_backend_errors_with_backoff() {
        let handle = StoreHandle::new(flaky(2, StoreError::Backend("busy".into())), 3);
        let start = Instant::now();
        let ids = handle.run("list_running", |s| s.list_running()).await.unwrap();
        assert_eq!(ids, vec![SessionId(1)]);
        // 50ms + 100ms of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let handle = StoreHandle::new(flaky(5, StoreError::Backend("busy".into())), 3);
        let err = handle.run("list_running", |s| s.list_running()).await.unwrap_err();
        assert_eq!(err, StoreError::Backend("busy".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_corruption() {
        let handle = StoreHandle::new(flaky(1, StoreError::Corrupt("bad".into())), 3);
        let start = Instant::now();
        assert!(handle.run("list_running", |s| s.list_running()).await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let clock = Clock::new();
        let t0 = clock.now();
        tokio::time::sleep(Duration::from_millis(1_250)).await;
        assert_eq!((clock.now() - t0).num_milliseconds(), 1_250);
    }
}
