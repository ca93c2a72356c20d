//! Workflow turn phases
//!
//! Encodes the legal request chain for one conversational turn:
//! utterance → statement → token → assertions → token → evidence. The
//! transition function is pure; the session facade owns the per-chat phase
//! and drives it, rejecting operations that are illegal in the current
//! phase. Any error delivery returns the turn to `Idle`.

#[cfg(test)]
mod proptests;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a conversational turn currently stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// Ready for a new utterance, nothing outstanding.
    #[default]
    Idle,
    /// Utterance sent; statement streaming in.
    AwaitingStatement,
    StatementReady,
    /// Statement token being fetched (live or cached).
    AwaitingToken,
    TokenReady,
    /// Statement token presented; assertions being derived.
    AwaitingAssertions,
    AssertionsReady,
    /// Evidence token being fetched for one assertion.
    AwaitingEvidenceToken,
    EvidenceTokenReady,
    /// Evidence token presented (or custom assertion sent); evidence being
    /// derived.
    AwaitingEvidence,
    EvidenceReady,
}

impl TurnPhase {
    /// Phases with no outstanding request; a new utterance is legal here.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TurnPhase::Idle
                | TurnPhase::StatementReady
                | TurnPhase::TokenReady
                | TurnPhase::AssertionsReady
                | TurnPhase::EvidenceTokenReady
                | TurnPhase::EvidenceReady
        )
    }
}

/// What just happened to the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    UtteranceSent,
    StatementArrived,
    TokenRequested,
    TokenArrived,
    TokenPresented,
    AssertionsArrived,
    EvidenceTokenRequested,
    EvidenceTokenArrived,
    EvidenceTokenPresented,
    CustomAssertionSent,
    EvidenceArrived,
    ErrorArrived,
}

/// Errors recovered locally by the workflow layer.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("operation not permitted while {phase:?}: {event:?}")]
    InvalidStep { phase: TurnPhase, event: TurnEvent },
    #[error("no continuation token available for {0}")]
    MissingToken(String),
    #[error("request superseded by a newer one for the same key")]
    Superseded,
    #[error("{0}")]
    Server(String),
}

/// Pure transition function: the next phase for (phase, event), or an
/// error when the event is not legal in that phase.
pub fn advance(phase: &TurnPhase, event: TurnEvent) -> Result<TurnPhase, WorkflowError> {
    match (phase, event) {
        // A fresh utterance starts a new turn from any settled phase.
        (p, TurnEvent::UtteranceSent) if p.is_settled() => Ok(TurnPhase::AwaitingStatement),
        (TurnPhase::AwaitingStatement, TurnEvent::StatementArrived) => Ok(TurnPhase::StatementReady),

        // Statement token leg.
        (TurnPhase::StatementReady, TurnEvent::TokenRequested) => Ok(TurnPhase::AwaitingToken),
        (TurnPhase::AwaitingToken, TurnEvent::TokenArrived) => Ok(TurnPhase::TokenReady),
        (TurnPhase::TokenReady, TurnEvent::TokenPresented) => Ok(TurnPhase::AwaitingAssertions),
        (TurnPhase::AwaitingAssertions, TurnEvent::AssertionsArrived) => {
            Ok(TurnPhase::AssertionsReady)
        }

        // Evidence legs, one per assertion; more evidence may be requested
        // after a previous leg completed.
        (
            TurnPhase::AssertionsReady | TurnPhase::EvidenceReady,
            TurnEvent::EvidenceTokenRequested,
        ) => Ok(TurnPhase::AwaitingEvidenceToken),
        (TurnPhase::AwaitingEvidenceToken, TurnEvent::EvidenceTokenArrived) => {
            Ok(TurnPhase::EvidenceTokenReady)
        }
        (TurnPhase::EvidenceTokenReady, TurnEvent::EvidenceTokenPresented) => {
            Ok(TurnPhase::AwaitingEvidence)
        }

        // Free-typed assertions skip the token handoff entirely.
        (p, TurnEvent::CustomAssertionSent) if p.is_settled() => Ok(TurnPhase::AwaitingEvidence),
        (TurnPhase::AwaitingEvidence, TurnEvent::EvidenceArrived) => Ok(TurnPhase::EvidenceReady),

        // Any leg may resolve with an error; the turn resets, never retried.
        (_, TurnEvent::ErrorArrived) => Ok(TurnPhase::Idle),

        (phase, event) => Err(WorkflowError::InvalidStep {
            phase: phase.clone(),
            event,
        }),
    }
}
