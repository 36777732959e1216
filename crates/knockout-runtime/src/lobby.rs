//! Session lifecycle controller: waiting room, countdown and start.
//!
//! All steps run under the arena's lobby lock, so quorum decisions,
//! countdown firing and the waiting → running transition never interleave.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use knockout_core::rules::generate_join_code;
use knockout_core::{
    CountdownOutcome, Identity, IdentityId, KnockoutError, LobbyTracker, MembershipUpdate,
    QuorumDecision, ServerEvent, SessionId, SessionPlayer, StoreError,
};

use crate::arena::{Arena, JoinOutcome};
use crate::round;

const NO_QUESTIONS_MESSAGE: &str = "no questions available, waiting for an operator";

pub(crate) async fn join_waiting_room(
    arena: &Arc<Arena>,
    identity: &Identity,
) -> Result<JoinOutcome, KnockoutError> {
    let mut lobby = arena.lobby.lock().await;
    let config = arena.config();

    let existing = arena
        .store()
        .run("find_open_waiting", |s| s.find_open_waiting())
        .await?;
    let session = match existing {
        Some(session) => session,
        None => {
            let capacity = config.capacity();
            let code_len = config.join_code_length;
            let now = arena.now();
            // A join-code collision surfaces as a backend error; each retry
            // draws a fresh code.
            let slot = arena
                .store()
                .run("create_waiting", |s| {
                    let code = generate_join_code(code_len, &mut rand::rng());
                    s.create_waiting(&code, capacity, now)
                })
                .await?;
            let session = slot.into_session();
            info!(session_id = %session.id, join_code = %session.join_code, "waiting session opened");
            session
        }
    };

    let update = match arena
        .registry()
        .join(session.id, session.capacity(), &identity.id)
    {
        Ok(update) => update,
        Err(e) => {
            if let KnockoutError::CapacityExceeded { max, .. } = e {
                debug!(identity = %identity.id, session_id = %session.id, max, "waiting room full");
                arena
                    .notifier()
                    .send_to(&identity.id, ServerEvent::CapacityExceeded { max });
            }
            return Err(e);
        }
    };

    arena.notifier().subscribe(session.id, &identity.id);
    if update.changed {
        info!(
            session_id = %session.id,
            identity = %identity.id,
            count = update.count,
            "joined waiting room"
        );
        arena.notifier().broadcast(session.id, update.to_event());
    } else {
        arena.notifier().send_to(&identity.id, update.to_event());
    }

    let tracker = lobby
        .entry(session.id)
        .or_insert_with(|| LobbyTracker::new(session.min_players, config.start_delay()));
    if let QuorumDecision::ScheduleCountdown { delay, target } =
        tracker.on_membership(update.count, arena.now())
    {
        info!(session_id = %session.id, delay_ms = delay.as_millis() as u64, "countdown scheduled");
        arena.notifier().broadcast(
            session.id,
            ServerEvent::CountdownStarted {
                delay_ms: delay.as_millis() as u64,
                target_start_time: target,
            },
        );
        schedule_countdown(arena, session.id, delay);
    }

    Ok(JoinOutcome::Waiting {
        session_id: session.id,
        join_code: session.join_code,
        update,
    })
}

/// Leave every waiting room the identity is in and rebroadcast counts.
/// A pending countdown is not cancelled; it re-checks quorum when it fires.
pub(crate) async fn leave_waiting_room(
    arena: &Arc<Arena>,
    identity: &IdentityId,
) -> Vec<MembershipUpdate> {
    let _lobby = arena.lobby.lock().await;
    let updates = arena.registry().leave_all(identity);
    for update in &updates {
        arena.notifier().unsubscribe(update.session_id, identity);
        arena
            .notifier()
            .broadcast(update.session_id, update.to_event());
        info!(
            session_id = %update.session_id,
            identity = %identity,
            count = update.count,
            "left waiting room"
        );
    }
    updates
}

fn schedule_countdown(arena: &Arc<Arena>, session_id: SessionId, delay: Duration) {
    let task_arena = Arc::clone(arena);
    let cancel = arena.cancel_token();
    arena.spawn_task("countdown", session_id, async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => countdown_fired(&task_arena, session_id).await,
            _ = cancel.cancelled() => {}
        }
    });
}

async fn countdown_fired(arena: &Arc<Arena>, session_id: SessionId) {
    let mut lobby = arena.lobby.lock().await;
    let Some(tracker) = lobby.get_mut(&session_id) else {
        return;
    };

    match tracker.on_countdown_fired(arena.registry().size(session_id)) {
        CountdownOutcome::Ignore => return,
        CountdownOutcome::Revert { count } => {
            warn!(session_id = %session_id, count, "quorum lost before start, back to waiting");
            if let Some(update) = arena.registry().current(session_id) {
                arena.notifier().broadcast(session_id, update.to_event());
            }
            return;
        }
        CountdownOutcome::Start => {}
    }

    match arena.questions().count_available() {
        Ok(n) if n > 0 => {}
        Ok(_) => {
            warn!(session_id = %session_id, "question pool empty, start aborted");
            abort_start(arena, tracker, session_id);
            return;
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "question source unavailable, start aborted");
            abort_start(arena, tracker, session_id);
            return;
        }
    }

    match start_session(arena, session_id).await {
        Ok(true) => {
            tracker.on_started();
            lobby.remove(&session_id);
        }
        Ok(false) => {
            // Someone else moved the session on; it is no longer ours to start.
            warn!(session_id = %session_id, "session no longer waiting at start");
            lobby.remove(&session_id);
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "session start failed, back to waiting");
            tracker.on_start_aborted();
        }
    }
}

fn abort_start(arena: &Arena, tracker: &mut LobbyTracker, session_id: SessionId) {
    tracker.on_start_aborted();
    arena.notifier().broadcast(
        session_id,
        ServerEvent::NoQuestionsAvailable {
            message: NO_QUESTIONS_MESSAGE.to_string(),
        },
    );
}

/// waiting → running with the live registry as the authoritative roster.
async fn start_session(arena: &Arc<Arena>, session_id: SessionId) -> Result<bool, StoreError> {
    let waiting = arena
        .store()
        .run("load_session", |s| s.load_session(session_id))
        .await?;
    let persisted: Vec<IdentityId> = waiting.players.iter().map(|p| p.identity.clone()).collect();
    let report = arena.registry().reconcile(session_id, &persisted);
    if report.duplicates > 0 || !report.dropped.is_empty() {
        debug!(
            session_id = %session_id,
            duplicates = report.duplicates,
            dropped = report.dropped.len(),
            "reconciled persisted roster"
        );
    }
    let roster: Vec<SessionPlayer> = report
        .roster
        .into_iter()
        .map(|id| {
            let connection = arena.notifier().connection_of(&id);
            SessionPlayer::new(id, connection)
        })
        .collect();

    let now = arena.now();
    let started = arena
        .store()
        .run("start_session", |s| s.start_session(session_id, &roster, now))
        .await?;
    if !started {
        return Ok(false);
    }

    // Committed: from here on the session belongs to its actor, which
    // loads the durable record itself and suspends on a failed load.
    arena.registry().clear(session_id);
    for player in &roster {
        arena.notifier().subscribe(session_id, &player.identity);
    }
    info!(
        session_id = %session_id,
        players = roster.len(),
        "session started"
    );
    round::spawn_session(arena, session_id);
    arena.notifier().broadcast(
        session_id,
        ServerEvent::SessionStarted {
            session_id,
            join_code: waiting.join_code,
        },
    );
    Ok(true)
}
