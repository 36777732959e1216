//! knockout-core: data model, rules and seams of the elimination trivia game.
//! No IO and no async runtime; the runtime crate drives everything here.

pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod membership;
pub mod rules;
pub mod types;

pub use collab::{CredentialVerifier, NameDirectory, QuestionSource, SessionStore, WaitingSlot};
pub use config::GameConfig;
pub use error::{ConfigError, KnockoutError, QuestionSourceError, StoreError};
pub use events::{ServerEvent, SpectatorReason, WinnerInfo};
pub use lifecycle::{CountdownOutcome, LobbyPhase, LobbyTracker, QuorumDecision};
pub use membership::{MembershipRegistry, MembershipUpdate, ReconcileReport};
pub use rules::{AnswerSubmission, RoundResolution};
pub use types::*;
