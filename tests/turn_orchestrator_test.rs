//! Integration tests for the turn orchestrator
//!
//! These tests drive the state machine with agent and backend events and
//! check the effects it returns:
//! 1. Streamed replies are spoken once per flushed chunk
//! 2. Interruptions cancel the request in flight and silence late replies
//! 3. Shutdown stops the agent exactly once
//! 4. Arbitrary interleavings never leave two requests in flight
//! 5. Speech events for an abandoned reply never reach the new turn

use dialogue_bridge::agent::{AgentCommand, ListenConfig};
use dialogue_bridge::dialogue::flush::ends_sentence;
use dialogue_bridge::dialogue::{
    ConversationHistory, Effect, OrchestratorSettings, Role, StreamFlushPolicy, TurnEvent,
    TurnOrchestrator, TurnPhase,
};
use dialogue_bridge::llm::BackendError;
use std::time::{Duration, Instant};

const FALLBACK: &str = "Sorry, I lost my train of thought.";

/// Helper to create an orchestrator without an opening line
fn create_orchestrator(t0: Instant) -> TurnOrchestrator {
    TurnOrchestrator::new(
        OrchestratorSettings {
            opening_line: None,
            fallback_utterance: FALLBACK.to_string(),
            listen: ListenConfig::default(),
            flush: StreamFlushPolicy::new(Duration::from_millis(400)),
        },
        ConversationHistory::new(),
        t0,
    )
}

fn spoken(effects: &[Effect]) -> Vec<String> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Agent(AgentCommand::SpeakText(text)) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn user_says(orchestrator: &mut TurnOrchestrator, text: &str, now: Instant) -> (Vec<Effect>, u64) {
    let mut effects = orchestrator.handle(TurnEvent::UserSpeechStart, now);
    effects.extend(orchestrator.handle(
        TurnEvent::UserSpeechEnd {
            text: text.to_string(),
        },
        now,
    ));
    let id = effects
        .iter()
        .find_map(|e| match e {
            Effect::StartRequest { id, .. } => Some(*id),
            _ => None,
        })
        .expect("no request started");
    (effects, id)
}

fn history_pairs(orchestrator: &TurnOrchestrator) -> Vec<(Role, String)> {
    orchestrator
        .history()
        .iter()
        .map(|u| (u.role, u.text.clone()))
        .collect()
}

/// Test 1: Streamed weather reply
///
/// Verifies:
/// - Three fragments ending in a sentence produce exactly one speak command
/// - History gains the user question and the spoken reply, in order
#[test]
fn test_streamed_reply_spoken_once() {
    let t0 = Instant::now();
    let mut orchestrator = create_orchestrator(t0);
    let (_, id) = user_says(&mut orchestrator, "What's the weather?", t0);

    let mut speaks = Vec::new();
    for (i, fragment) in ["It's", " sunny", " today."].iter().enumerate() {
        let effects = orchestrator.handle(
            TurnEvent::Fragment {
                id,
                text: fragment.to_string(),
            },
            t0 + Duration::from_millis(50 * (i as u64 + 1)),
        );
        speaks.extend(spoken(&effects));
    }
    let effects = orchestrator.handle(
        TurnEvent::ResponseComplete {
            id,
            text: "It's sunny today.".to_string(),
        },
        t0 + Duration::from_millis(200),
    );
    speaks.extend(spoken(&effects));
    assert_eq!(speaks, vec!["It's sunny today."]);
    assert_eq!(orchestrator.phase(), TurnPhase::AgentSpeaking);

    orchestrator.handle(
        TurnEvent::AgentSpeechStart {
            text: "It's sunny today.".to_string(),
        },
        t0 + Duration::from_millis(250),
    );
    orchestrator.handle(
        TurnEvent::AgentSpeechEnd {
            text: "It's sunny today.".to_string(),
        },
        t0 + Duration::from_secs(2),
    );

    assert_eq!(
        history_pairs(&orchestrator),
        vec![
            (Role::User, "What's the weather?".to_string()),
            (Role::Assistant, "It's sunny today.".to_string()),
        ]
    );
    assert_eq!(orchestrator.phase(), TurnPhase::Idle);
}

/// Test 2: Interruption while the model is pending
///
/// Verifies:
/// - The request is cancelled before the new turn starts
/// - The late completion of the cancelled request is silent and not committed
#[test]
fn test_interruption_silences_late_completion() {
    let t0 = Instant::now();
    let mut orchestrator = create_orchestrator(t0);
    let (_, first) = user_says(&mut orchestrator, "Tell me a long story", t0);
    assert_eq!(orchestrator.phase(), TurnPhase::ModelPending);

    let effects = orchestrator.handle(TurnEvent::UserSpeechStart, t0);
    assert_eq!(effects.first(), Some(&Effect::CancelRequest));
    assert_eq!(orchestrator.phase(), TurnPhase::UserSpeaking);

    let effects = orchestrator.handle(
        TurnEvent::UserSpeechEnd {
            text: "Actually, never mind".to_string(),
        },
        t0,
    );
    let second = match &effects[..] {
        [Effect::StartRequest { id, context, .. }] => {
            assert!(context.is_empty());
            *id
        }
        other => panic!("unexpected effects {:?}", other),
    };
    assert_ne!(first, second);

    let late = orchestrator.handle(
        TurnEvent::ResponseComplete {
            id: first,
            text: "Once upon a time...".to_string(),
        },
        t0,
    );
    assert!(late.is_empty());
    assert!(orchestrator.history().is_empty());
    assert_eq!(orchestrator.active_request(), Some(second));
}

/// Test 3: Shutdown while a request is pending
///
/// Verifies:
/// - The request is cancelled
/// - stopListening and stopSpeaking are issued exactly once each
/// - Later events are dropped
#[test]
fn test_shutdown_mid_request() {
    let t0 = Instant::now();
    let mut orchestrator = create_orchestrator(t0);
    let (_, id) = user_says(&mut orchestrator, "Hello?", t0);

    let mut effects = orchestrator.handle(TurnEvent::Shutdown, t0);
    effects.extend(orchestrator.handle(TurnEvent::Shutdown, t0));
    effects.extend(orchestrator.handle(
        TurnEvent::ResponseComplete {
            id,
            text: "Hi!".to_string(),
        },
        t0,
    ));
    effects.extend(orchestrator.handle(TurnEvent::UserSpeechStart, t0));

    assert_eq!(
        effects,
        vec![
            Effect::CancelRequest,
            Effect::Agent(AgentCommand::StopListening),
            Effect::Agent(AgentCommand::StopSpeaking),
        ]
    );
    assert_eq!(orchestrator.phase(), TurnPhase::ShuttingDown);
    assert!(orchestrator.history().is_empty());
}

/// Test 4: Barge-in during a streamed answer keeps what was already spoken
#[test]
fn test_barge_in_commits_issued_text() {
    let t0 = Instant::now();
    let mut orchestrator = create_orchestrator(t0);
    let (_, id) = user_says(&mut orchestrator, "Name two planets", t0);

    let effects = orchestrator.handle(
        TurnEvent::Fragment {
            id,
            text: "Mars is one.".to_string(),
        },
        t0,
    );
    assert_eq!(spoken(&effects), vec!["Mars is one."]);
    orchestrator.handle(
        TurnEvent::AgentSpeechStart {
            text: "Mars is one.".to_string(),
        },
        t0,
    );

    let effects = orchestrator.handle(TurnEvent::UserSpeechStart, t0);
    assert_eq!(effects[0], Effect::CancelRequest);
    assert_eq!(
        history_pairs(&orchestrator),
        vec![
            (Role::User, "Name two planets".to_string()),
            (Role::Assistant, "Mars is one.".to_string()),
        ]
    );
}

/// Test 5: Failed request speaks the fallback and commits it as the reply
#[test]
fn test_failed_request_commits_fallback() {
    let t0 = Instant::now();
    let mut orchestrator = create_orchestrator(t0);
    let (_, id) = user_says(&mut orchestrator, "Are you there?", t0);

    let effects = orchestrator.handle(
        TurnEvent::RequestFailed {
            id,
            reason: BackendError::Status {
                status: 503,
                body: "overloaded".to_string(),
            },
        },
        t0,
    );
    assert_eq!(spoken(&effects), vec![FALLBACK]);

    orchestrator.handle(
        TurnEvent::AgentSpeechEnd {
            text: String::new(),
        },
        t0,
    );
    assert_eq!(
        history_pairs(&orchestrator),
        vec![
            (Role::User, "Are you there?".to_string()),
            (Role::Assistant, FALLBACK.to_string()),
        ]
    );
}

/// Test 6: Flush policy boundaries
#[test]
fn test_flush_policy_boundaries() {
    let policy = StreamFlushPolicy::new(Duration::from_millis(400));
    let t0 = Instant::now();

    assert!(policy.should_flush("Hello there.", t0, t0, ends_sentence("there.")));
    assert!(!policy.should_flush(
        "Hello the",
        t0 + Duration::from_millis(100),
        t0,
        ends_sentence("the")
    ));
    assert!(!policy.should_flush(
        "Hello the",
        t0 + Duration::from_millis(400),
        t0,
        false
    ));
    assert!(policy.should_flush("Hello the", t0 + Duration::from_millis(401), t0, false));
    assert!(!policy.should_flush("   ", t0 + Duration::from_secs(5), t0, true));
}

/// Small deterministic generator for event interleavings
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

/// Text issued by the agent for one user turn
struct TurnRecord {
    user_text: String,
    issued: Vec<String>,
}

/// Test 7: Arbitrary interleavings
///
/// Verifies:
/// - A request is only started when none is in flight
/// - History always alternates user and assistant, starting with the user
/// - Nothing is spoken for a request that is no longer current
/// - Committed assistant text was issued for the user text it follows, even
///   when the agent reports speech for older chunks
#[test]
fn test_random_interleavings_keep_one_request_in_flight() {
    for seed in 1..=50u64 {
        let mut rng = Lcg(seed);
        let t0 = Instant::now();
        let mut orchestrator = create_orchestrator(t0);
        let mut in_flight: Option<u64> = None;
        let mut last_started: u64 = 0;
        let mut turn: Option<TurnRecord> = None;
        let mut issued_log: Vec<String> = Vec::new();

        for step in 0..200u64 {
            let now = t0 + Duration::from_millis(step * 150);
            // Replies either belong to the request in flight or to an old one
            let reply_id = match in_flight {
                Some(id) if rng.next(4) != 0 => id,
                _ => last_started.saturating_sub(rng.next(3)),
            };
            let current = in_flight == Some(reply_id);
            // Agent speech reports carry no text, or any text issued so far
            let speech_text = if !issued_log.is_empty() && rng.next(2) == 0 {
                issued_log[rng.next(issued_log.len() as u64) as usize].clone()
            } else {
                String::new()
            };

            let event = match rng.next(9) {
                0 => TurnEvent::UserSpeechStart,
                1 => TurnEvent::UserSpeechEnd {
                    text: ["hello", "  ", "what time is it", "tell me more"]
                        [rng.next(4) as usize]
                        .to_string(),
                },
                2 => TurnEvent::AgentSpeechStart { text: speech_text },
                3 => TurnEvent::AgentSpeechEnd { text: speech_text },
                4 | 5 => TurnEvent::Fragment {
                    id: reply_id,
                    text: [" well", " yes.", " maybe", "   "][rng.next(4) as usize].to_string(),
                },
                6 => TurnEvent::ResponseComplete {
                    id: reply_id,
                    text: ["Sure.", "", "It is noon."][rng.next(3) as usize].to_string(),
                },
                7 => TurnEvent::RequestFailed {
                    id: reply_id,
                    reason: BackendError::Timeout(30),
                },
                _ => TurnEvent::RequestCancelled { id: reply_id },
            };
            let finishes = matches!(
                event,
                TurnEvent::ResponseComplete { .. }
                    | TurnEvent::RequestFailed { .. }
                    | TurnEvent::RequestCancelled { .. }
            );
            let from_backend = finishes || matches!(event, TurnEvent::Fragment { .. });

            let effects = orchestrator.handle(event, now);

            if from_backend && !current {
                assert!(effects.is_empty(), "seed {} step {}: stale reply had effects", seed, step);
            }
            if finishes && current {
                in_flight = None;
            }
            for effect in &effects {
                match effect {
                    Effect::CancelRequest => in_flight = None,
                    Effect::StartRequest { id, user_text, .. } => {
                        assert!(
                            in_flight.is_none(),
                            "seed {} step {}: request {} started while {:?} in flight",
                            seed,
                            step,
                            id,
                            in_flight
                        );
                        in_flight = Some(*id);
                        last_started = *id;
                        turn = Some(TurnRecord {
                            user_text: user_text.clone(),
                            issued: Vec::new(),
                        });
                    }
                    Effect::Agent(AgentCommand::SpeakText(text)) => {
                        issued_log.push(text.clone());
                        if let Some(turn) = turn.as_mut() {
                            turn.issued.push(text.clone());
                        }
                    }
                    Effect::Record(utterance) => {
                        let turn = turn.as_ref().expect("utterance recorded outside a turn");
                        match utterance.role {
                            Role::User => assert_eq!(
                                utterance.text, turn.user_text,
                                "seed {} step {}: committed user text from another turn",
                                seed, step
                            ),
                            Role::Assistant => {
                                let said: Vec<String> = (1..=turn.issued.len())
                                    .map(|n| turn.issued[..n].join(" "))
                                    .collect();
                                assert!(
                                    said.contains(&utterance.text),
                                    "seed {} step {}: {:?} was not issued for {:?} (issued {:?})",
                                    seed,
                                    step,
                                    utterance.text,
                                    turn.user_text,
                                    turn.issued
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
            assert_eq!(orchestrator.active_request(), in_flight);

            let roles: Vec<Role> = orchestrator.history().iter().map(|u| u.role).collect();
            for (i, role) in roles.iter().enumerate() {
                let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
                assert_eq!(*role, expected, "seed {} step {}: history {:?}", seed, step, roles);
            }
        }
    }
}

/// Test 8: Speech reports for an interrupted reply arrive after the next turn started
///
/// Verifies:
/// - The interrupt stops the agent from speaking queued chunks
/// - Start and end events naming the old chunk do not commit the new user turn
/// - History pairs the new question with the new answer only
#[test]
fn test_late_speech_events_for_interrupted_reply_are_ignored() {
    let t0 = Instant::now();
    let mut orchestrator = create_orchestrator(t0);
    let (_, first) = user_says(&mut orchestrator, "A", t0);

    let effects = orchestrator.handle(
        TurnEvent::Fragment {
            id: first,
            text: "Old answer.".to_string(),
        },
        t0,
    );
    assert_eq!(spoken(&effects), vec!["Old answer."]);

    let effects = orchestrator.handle(TurnEvent::UserSpeechStart, t0);
    assert_eq!(effects[0], Effect::CancelRequest);
    assert!(effects.contains(&Effect::Agent(AgentCommand::StopSpeaking)));
    // Nothing was heard yet, so the abandoned turn leaves no trace
    assert!(orchestrator.history().is_empty());

    let effects = orchestrator.handle(
        TurnEvent::UserSpeechEnd {
            text: "B".to_string(),
        },
        t0,
    );
    let second = match &effects[..] {
        [Effect::StartRequest { id, .. }] => *id,
        other => panic!("unexpected effects {:?}", other),
    };
    let effects = orchestrator.handle(
        TurnEvent::Fragment {
            id: second,
            text: "New answer.".to_string(),
        },
        t0 + Duration::from_millis(100),
    );
    assert_eq!(spoken(&effects), vec!["New answer."]);

    for event in [
        TurnEvent::AgentSpeechStart {
            text: "Old answer.".to_string(),
        },
        TurnEvent::AgentSpeechEnd {
            text: "Old answer.".to_string(),
        },
    ] {
        assert!(orchestrator.handle(event, t0 + Duration::from_millis(150)).is_empty());
    }
    assert!(orchestrator.history().is_empty());

    let effects = orchestrator.handle(
        TurnEvent::ResponseComplete {
            id: second,
            text: "New answer.".to_string(),
        },
        t0 + Duration::from_millis(200),
    );
    assert!(spoken(&effects).is_empty());
    orchestrator.handle(
        TurnEvent::AgentSpeechStart {
            text: "New answer.".to_string(),
        },
        t0 + Duration::from_millis(250),
    );
    orchestrator.handle(
        TurnEvent::AgentSpeechEnd {
            text: "New answer.".to_string(),
        },
        t0 + Duration::from_secs(1),
    );

    assert_eq!(
        history_pairs(&orchestrator),
        vec![
            (Role::User, "B".to_string()),
            (Role::Assistant, "New answer.".to_string()),
        ]
    );
    assert_eq!(orchestrator.phase(), TurnPhase::Idle);
}
