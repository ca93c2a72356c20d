//! Property-based tests for the turn-phase machine
//!
//! These verify key invariants hold across all (phase, event) pairs and
//! arbitrary event sequences.

use super::*;
use proptest::prelude::*;

fn arb_phase() -> impl Strategy<Value = TurnPhase> {
    prop_oneof![
        Just(TurnPhase::Idle),
        Just(TurnPhase::AwaitingStatement),
        Just(TurnPhase::StatementReady),
        Just(TurnPhase::AwaitingToken),
        Just(TurnPhase::TokenReady),
        Just(TurnPhase::AwaitingAssertions),
        Just(TurnPhase::AssertionsReady),
        Just(TurnPhase::AwaitingEvidenceToken),
        Just(TurnPhase::EvidenceTokenReady),
        Just(TurnPhase::AwaitingEvidence),
        Just(TurnPhase::EvidenceReady),
    ]
}

fn arb_event() -> impl Strategy<Value = TurnEvent> {
    prop_oneof![
        Just(TurnEvent::UtteranceSent),
        Just(TurnEvent::StatementArrived),
        Just(TurnEvent::TokenRequested),
        Just(TurnEvent::TokenArrived),
        Just(TurnEvent::TokenPresented),
        Just(TurnEvent::AssertionsArrived),
        Just(TurnEvent::EvidenceTokenRequested),
        Just(TurnEvent::EvidenceTokenArrived),
        Just(TurnEvent::EvidenceTokenPresented),
        Just(TurnEvent::CustomAssertionSent),
        Just(TurnEvent::EvidenceArrived),
        Just(TurnEvent::ErrorArrived),
    ]
}

proptest! {
    /// `advance` is total: any (phase, event) pair yields a phase or a
    /// typed rejection, never a panic.
    #[test]
    fn advance_never_panics(phase in arb_phase(), event in arb_event()) {
        let _ = advance(&phase, event);
    }

    /// An error delivery lands on Idle no matter where the turn stood.
    #[test]
    fn error_always_resets_to_idle(phase in arb_phase()) {
        prop_assert_eq!(advance(&phase, TurnEvent::ErrorArrived).unwrap(), TurnPhase::Idle);
    }

    /// A rejected event leaves the turn where it was by construction: the
    /// caller keeps the old phase. Check rejections only occur while a
    /// request is outstanding or the event is out of sequence.
    #[test]
    fn settled_phases_accept_new_turns(phase in arb_phase()) {
        let result = advance(&phase, TurnEvent::UtteranceSent);
        if phase.is_settled() {
            prop_assert_eq!(result.unwrap(), TurnPhase::AwaitingStatement);
        } else {
            prop_assert!(result.is_err());
        }
    }

    /// Arbitrary event sequences keep the machine inside the phase set and
    /// never wedge it: from any reachable phase, an error event recovers
    /// to Idle, from which a new turn is always legal.
    #[test]
    fn no_sequence_wedges_the_machine(events in proptest::collection::vec(arb_event(), 0..32)) {
        let mut phase = TurnPhase::Idle;
        for event in events {
            if let Ok(next) = advance(&phase, event) {
                phase = next;
            }
        }
        let recovered = advance(&phase, TurnEvent::ErrorArrived).unwrap();
        prop_assert_eq!(advance(&recovered, TurnEvent::UtteranceSent).unwrap(),
            TurnPhase::AwaitingStatement);
    }
}
