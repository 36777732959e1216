//! Round scheduler: one actor task per running session.
//!
//! Every transition of a session (open round, record answer, close round,
//! finish) runs inside its actor, fed by a command queue. Timers are plain
//! tasks that post commands back. The round timeout and the last-answer
//! trigger both end in `close_round`, which is idempotent twice over: the
//! actor ignores a round that is no longer open in its cache, and the store
//! only closes a round that is still open on disk.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use knockout_core::rules::{
    all_answered, apply_answer, apply_resolution, latency_ms, remaining_budget, resolve_round,
    select_question, terminal_winner, AnswerSubmission,
};
use knockout_core::{
    AnswerRecord, ConnectionId, IdentityId, KnockoutError, Question, Round, RoundId, ServerEvent,
    Session, SessionId, SessionStatus, SpectatorReason, StoreError,
};

use crate::arena::Arena;

const COMMAND_QUEUE: usize = 256;

type Flow = ControlFlow<()>;

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Answer {
        identity: IdentityId,
        submission: AnswerSubmission,
        received_at: DateTime<Utc>,
    },
    Reconnect {
        identity: IdentityId,
        connection: ConnectionId,
    },
    Disconnect {
        identity: IdentityId,
        connection: ConnectionId,
    },
    RoundTimeout {
        round_id: RoundId,
    },
    /// Open the next round. Stale when `epoch` no longer matches.
    NextRound {
        epoch: u64,
    },
    /// Drop the cache and rehydrate from the store.
    Recover,
}

enum ActorState {
    Active(Session),
    /// Cache dropped after a persistence failure; waiting for `Recover`.
    Suspended,
}

/// Spawn the actor for a running session. It starts suspended and
/// rehydrates from the store, so a freshly started session and one
/// recovered after a restart take the same path.
pub(crate) fn spawn_session(arena: &Arc<Arena>, session_id: SessionId) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    arena.register_actor(session_id, tx.clone());

    let actor = SessionActor {
        arena: Arc::clone(arena),
        session_id,
        state: ActorState::Suspended,
        question: None,
        round_timer: None,
        epoch: 0,
        tx,
    };
    post(&actor.tx, SessionCommand::Recover);
    arena.spawn_task("session", session_id, actor.run(rx));
}

fn post(tx: &mpsc::Sender<SessionCommand>, cmd: SessionCommand) {
    if let Err(e) = tx.try_send(cmd) {
        warn!(error = %e, "session command queue rejected command");
    }
}

fn spawn_timer(tx: mpsc::Sender<SessionCommand>, after: Duration, cmd: SessionCommand) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(cmd).await;
    })
}

/// Event telling one player about the open round: the question when
/// eligible, a spectator notice when eliminated.
fn round_notice(
    session: &Session,
    round: &Round,
    question: &Question,
    eliminated: bool,
    budget: Duration,
    remaining: Duration,
) -> ServerEvent {
    if eliminated {
        return ServerEvent::Spectating {
            session_id: session.id,
            round_id: round.id,
            reason: SpectatorReason::Eliminated,
        };
    }
    ServerEvent::QuestionDispatched {
        session_id: session.id,
        round_id: round.id,
        question_id: question.id.clone(),
        statement: question.statement.clone(),
        options: question.options.clone(),
        category: question.category.clone(),
        time_budget_ms: budget.as_millis() as u64,
        remaining_ms: remaining.as_millis() as u64,
    }
}

struct SessionActor {
    arena: Arc<Arena>,
    session_id: SessionId,
    state: ActorState,
    /// Question of the open round, kept for reconnect resends.
    question: Option<Question>,
    round_timer: Option<JoinHandle<()>>,
    /// Bumped whenever pending `NextRound` timers must be invalidated.
    epoch: u64,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        let cancel = self.arena.cancel_token();
        info!(session_id = %self.session_id, "session actor started");
        loop {
            let cmd = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "session actor cancelled");
                    break;
                }
            };
            if self.handle(cmd).await.is_break() {
                break;
            }
        }
        self.stop_round_timer();
        self.arena.unregister_actor(self.session_id);
    }

    async fn handle(&mut self, cmd: SessionCommand) -> Flow {
        let result = match cmd {
            SessionCommand::Answer {
                identity,
                submission,
                received_at,
            } => self.answer(identity, submission, received_at).await,
            SessionCommand::Reconnect {
                identity,
                connection,
            } => self.reconnect(identity, connection).await,
            SessionCommand::Disconnect {
                identity,
                connection,
            } => self.disconnect(identity, connection).await,
            SessionCommand::RoundTimeout { round_id } => {
                debug!(session_id = %self.session_id, round_id = %round_id, "round timer fired");
                self.close_round(round_id).await
            }
            SessionCommand::NextRound { epoch } => {
                if epoch != self.epoch {
                    return ControlFlow::Continue(());
                }
                self.next_round().await
            }
            SessionCommand::Recover => self.recover().await,
        };
        match result {
            Ok(flow) => flow,
            Err(StoreError::NotFound(id)) => {
                error!(session_id = %id, "session vanished from the store, stopping actor");
                ControlFlow::Break(())
            }
            Err(e) => {
                self.suspend(e);
                ControlFlow::Continue(())
            }
        }
    }

    fn stop_round_timer(&mut self) {
        if let Some(timer) = self.round_timer.take() {
            timer.abort();
        }
    }

    fn schedule_next_round(&mut self, delay: Duration) {
        self.epoch += 1;
        // Between-round timers are never aborted, only invalidated by epoch.
        drop(spawn_timer(
            self.tx.clone(),
            delay,
            SessionCommand::NextRound { epoch: self.epoch },
        ));
    }

    /// The durable record disagrees with the cache: drop it and reload.
    fn resync(&mut self) {
        self.state = ActorState::Suspended;
        self.question = None;
        self.epoch += 1;
        self.stop_round_timer();
        post(&self.tx, SessionCommand::Recover);
    }

    fn suspend(&mut self, err: StoreError) {
        error!(
            session_id = %self.session_id,
            error = %err,
            "persistence failed, session suspended until recovery"
        );
        self.state = ActorState::Suspended;
        self.question = None;
        self.epoch += 1;
        self.stop_round_timer();
        drop(spawn_timer(
            self.tx.clone(),
            self.arena.config().recovery_delay(),
            SessionCommand::Recover,
        ));
    }

    // ---- round lifecycle --------------------------------------------------

    async fn next_round(&mut self) -> Result<Flow, StoreError> {
        let arena = Arc::clone(&self.arena);
        let session_id = self.session_id;
        let ActorState::Active(session) = &mut self.state else {
            return Ok(ControlFlow::Continue(()));
        };
        if session.open_round().is_some() {
            return Ok(ControlFlow::Continue(()));
        }
        if let Some(winner) = terminal_winner(session) {
            return self.finish(winner).await;
        }

        let recent = session.recent_questions(arena.config().recent_question_window);
        let question = match select_question(arena.questions(), &recent) {
            Ok(q) => q,
            Err(KnockoutError::EmptyQuestionPool) => {
                // Status cannot go back to waiting once running.
                warn!(session_id = %session_id, "question pool exhausted mid-session");
                arena.notifier().broadcast(
                    session_id,
                    ServerEvent::NoQuestionsAvailable {
                        message: "question pool is empty, session ends".to_string(),
                    },
                );
                return self.finish(None).await;
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "question selection failed, retrying later");
                self.schedule_next_round(arena.config().between_rounds_delay());
                return Ok(ControlFlow::Continue(()));
            }
        };

        let started_at = arena.now();
        let appended = arena
            .store()
            .run("append_round", |s| s.append_round(session_id, &question, started_at))
            .await?;
        let Some(round_id) = appended else {
            warn!(session_id = %session_id, "store refused a new round, rehydrating");
            self.resync();
            return Ok(ControlFlow::Continue(()));
        };

        let round = Round {
            id: round_id,
            question_id: question.id.clone(),
            correct_option: question.correct_option_index,
            started_at,
            ended_at: None,
            answers: Vec::new(),
        };
        let budget = arena.config().question_time();
        for player in &session.players {
            let notice = round_notice(session, &round, &question, player.eliminated, budget, budget);
            arena.notifier().send_to(&player.identity, notice);
        }
        info!(
            session_id = %session_id,
            round_id = %round_id,
            question_id = %question.id,
            eligible = session.eligible_count(),
            "round opened"
        );
        session.rounds.push(round);
        self.question = Some(question);
        self.stop_round_timer();
        self.round_timer = Some(spawn_timer(
            self.tx.clone(),
            budget,
            SessionCommand::RoundTimeout { round_id },
        ));
        Ok(ControlFlow::Continue(()))
    }

    async fn answer(
        &mut self,
        identity: IdentityId,
        submission: AnswerSubmission,
        received_at: DateTime<Utc>,
    ) -> Result<Flow, StoreError> {
        let arena = Arc::clone(&self.arena);
        let session_id = self.session_id;
        let ActorState::Active(session) = &mut self.state else {
            debug!(session_id = %session_id, identity = %identity, "answer dropped while suspended");
            return Ok(ControlFlow::Continue(()));
        };
        let round = match knockout_core::rules::validate_submission(session, &identity, &submission) {
            Ok(round) => round,
            Err(e) => {
                debug!(session_id = %session_id, identity = %identity, reason = %e, "answer dropped");
                return Ok(ControlFlow::Continue(()));
            }
        };
        let round_id = round.id;
        let record = AnswerRecord {
            identity: identity.clone(),
            chosen_option: submission.chosen_option_index,
            correct: submission.chosen_option_index == round.correct_option,
            latency_ms: latency_ms(round.started_at, received_at),
        };

        let accepted = arena
            .store()
            .run("record_answer", |s| s.record_answer(round_id, &record))
            .await?;
        if !accepted {
            debug!(session_id = %session_id, identity = %identity, "answer already on record");
            return Ok(ControlFlow::Continue(()));
        }
        let skew_ms = submission
            .client_timestamp
            .map(|ts| received_at.timestamp_millis() - ts);
        info!(
            session_id = %session_id,
            round_id = %round_id,
            identity = %identity,
            correct = record.correct,
            latency_ms = record.latency_ms,
            client_skew_ms = ?skew_ms,
            "answer accepted"
        );
        apply_answer(session, round_id, &record);

        let Some(round) = session.open_round() else {
            return Ok(ControlFlow::Continue(()));
        };
        arena.notifier().broadcast(
            session_id,
            ServerEvent::AnswerProgress {
                round_id,
                answered_count: round.answers.len() as u32,
            },
        );
        if all_answered(session, round) {
            debug!(session_id = %session_id, round_id = %round_id, "every eligible player answered");
            return self.close_round(round_id).await;
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn close_round(&mut self, round_id: RoundId) -> Result<Flow, StoreError> {
        let arena = Arc::clone(&self.arena);
        let session_id = self.session_id;
        let ActorState::Active(session) = &mut self.state else {
            return Ok(ControlFlow::Continue(()));
        };
        let Some(round) = session.open_round().filter(|r| r.id == round_id) else {
            debug!(session_id = %session_id, round_id = %round_id, "round already closed");
            return Ok(ControlFlow::Continue(()));
        };
        let correct_option = round.correct_option;
        let resolution = resolve_round(session, &round.answers);
        let ended_at = arena.now();

        let closed = arena
            .store()
            .run("close_round", |s| s.close_round_if_open(round_id, ended_at, &resolution))
            .await?;
        if !closed {
            warn!(session_id = %session_id, round_id = %round_id, "round closed elsewhere, rehydrating");
            self.resync();
            return Ok(ControlFlow::Continue(()));
        }
        apply_resolution(session, round_id, ended_at, &resolution);
        self.question = None;
        if let Some(timer) = self.round_timer.take() {
            timer.abort();
        }

        let winner = resolution.winner().map(|w| arena.winner_info(w));
        info!(
            session_id = %session_id,
            round_id = %round_id,
            eliminated = resolution.eliminated.len(),
            eligible = resolution.eligible_count(),
            "round closed"
        );
        arena.notifier().broadcast(
            session_id,
            ServerEvent::RoundSummary {
                round_id,
                correct_option_index: correct_option,
                eliminated_identities: resolution.eliminated.clone(),
                eligible_count: resolution.eligible_count() as u32,
                winner,
            },
        );

        if resolution.is_terminal() {
            return self.finish(resolution.winner().cloned()).await;
        }
        self.schedule_next_round(arena.config().between_rounds_delay());
        Ok(ControlFlow::Continue(()))
    }

    async fn finish(&mut self, winner: Option<IdentityId>) -> Result<Flow, StoreError> {
        let arena = Arc::clone(&self.arena);
        let session_id = self.session_id;
        let now = arena.now();
        let finalized = arena
            .store()
            .run("finalize", |s| s.finalize(session_id, winner.as_ref(), now))
            .await?;
        if !finalized {
            warn!(session_id = %session_id, "session was not running at finalize");
        }
        if let ActorState::Active(session) = &mut self.state {
            session.status = SessionStatus::Finished;
            session.winner = winner.clone();
        }
        self.stop_round_timer();
        self.question = None;

        info!(session_id = %session_id, winner = ?winner, "session finished");
        arena.notifier().broadcast(
            session_id,
            ServerEvent::SessionFinished {
                session_id,
                winner: winner.as_ref().map(|w| arena.winner_info(w)),
            },
        );
        arena.notifier().drop_room(session_id);
        Ok(ControlFlow::Break(()))
    }

    // ---- presence ---------------------------------------------------------

    async fn reconnect(&mut self, identity: IdentityId, connection: ConnectionId) -> Result<Flow, StoreError> {
        let arena = Arc::clone(&self.arena);
        let session_id = self.session_id;
        let ActorState::Active(session) = &mut self.state else {
            debug!(session_id = %session_id, identity = %identity, "reconnect while suspended");
            return Ok(ControlFlow::Continue(()));
        };
        if session.player(&identity).is_none() {
            debug!(session_id = %session_id, identity = %identity, "reconnect from non-player ignored");
            return Ok(ControlFlow::Continue(()));
        }

        arena
            .store()
            .run("set_connection", |s| s.set_connection(session_id, &identity, Some(connection)))
            .await?;
        let Some(player) = session.player_mut(&identity) else {
            return Ok(ControlFlow::Continue(()));
        };
        player.connection = Some(connection);
        let (eliminated, score) = (player.eliminated, player.score);

        arena.notifier().subscribe(session_id, &identity);
        arena.notifier().send_to(
            &identity,
            ServerEvent::PlayerStatus {
                session_id,
                eliminated,
                score,
            },
        );
        if let (Some(round), Some(question)) = (session.open_round(), self.question.as_ref()) {
            let budget = arena.config().question_time();
            let remaining = remaining_budget(round.started_at, budget, arena.now());
            let notice = round_notice(session, round, question, eliminated, budget, remaining);
            arena.notifier().send_to(&identity, notice);
        }
        info!(session_id = %session_id, identity = %identity, eliminated, "player reconnected");
        Ok(ControlFlow::Continue(()))
    }

    async fn disconnect(&mut self, identity: IdentityId, connection: ConnectionId) -> Result<Flow, StoreError> {
        let arena = Arc::clone(&self.arena);
        let session_id = self.session_id;
        let ActorState::Active(session) = &mut self.state else {
            return Ok(ControlFlow::Continue(()));
        };
        let Some(player) = session.player_mut(&identity) else {
            return Ok(ControlFlow::Continue(()));
        };
        if player.connection != Some(connection) {
            return Ok(ControlFlow::Continue(()));
        }
        arena
            .store()
            .run("set_connection", |s| s.set_connection(session_id, &identity, None))
            .await?;
        player.connection = None;
        debug!(session_id = %session_id, identity = %identity, "player connection cleared");
        Ok(ControlFlow::Continue(()))
    }

    // ---- recovery ---------------------------------------------------------

    /// Rebuild the cache from the store and resume where the durable
    /// record says the session is.
    async fn recover(&mut self) -> Result<Flow, StoreError> {
        let arena = Arc::clone(&self.arena);
        let session_id = self.session_id;
        self.epoch += 1;
        self.stop_round_timer();
        self.question = None;

        let session = arena
            .store()
            .run("load_session", |s| s.load_session(session_id))
            .await?;
        if session.status != SessionStatus::Running {
            info!(session_id = %session_id, status = %session.status, "session no longer running");
            return Ok(ControlFlow::Break(()));
        }
        for player in &session.players {
            arena.notifier().subscribe(session_id, &player.identity);
        }
        let open = session
            .open_round()
            .map(|r| (r.id, r.question_id.clone(), r.started_at));
        self.state = ActorState::Active(session);

        let Some((round_id, question_id, started_at)) = open else {
            let delay = match &self.state {
                ActorState::Active(session) if session.rounds.is_empty() => {
                    arena.config().first_round_delay()
                }
                _ => arena.config().between_rounds_delay(),
            };
            info!(session_id = %session_id, delay_ms = delay.as_millis() as u64, "session resumed between rounds");
            self.schedule_next_round(delay);
            return Ok(ControlFlow::Continue(()));
        };

        let budget = arena.config().question_time();
        let remaining = remaining_budget(started_at, budget, arena.now());
        if remaining.is_zero() {
            info!(session_id = %session_id, round_id = %round_id, "open round expired while down");
            return self.close_round(round_id).await;
        }
        let answered = match &self.state {
            ActorState::Active(session) => session
                .open_round()
                .is_some_and(|round| all_answered(session, round)),
            ActorState::Suspended => false,
        };
        if answered {
            info!(session_id = %session_id, round_id = %round_id, "open round already fully answered");
            return self.close_round(round_id).await;
        }

        let question = match arena.questions().fetch(&question_id) {
            Ok(q) => q,
            Err(e) => {
                warn!(session_id = %session_id, question_id = %question_id, error = %e, "cannot refetch open question");
                None
            }
        };
        if let (ActorState::Active(session), Some(question)) = (&self.state, question.as_ref()) {
            if let Some(round) = session.open_round() {
                for player in &session.players {
                    let notice = round_notice(session, round, question, player.eliminated, budget, remaining);
                    arena.notifier().send_to(&player.identity, notice);
                }
            }
        }
        info!(
            session_id = %session_id,
            round_id = %round_id,
            remaining_ms = remaining.as_millis() as u64,
            "session resumed mid-round"
        );
        self.question = question;
        self.round_timer = Some(spawn_timer(
            self.tx.clone(),
            remaining,
            SessionCommand::RoundTimeout { round_id },
        ));
        Ok(ControlFlow::Continue(()))
    }
}
