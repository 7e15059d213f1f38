//! Bounded planner history.
//!
//! Only the newest `state_window_turns` environment messages keep their full
//! state rendering. Older ones keep the outcome summary of the turn before
//! them, condensed. Planner arguments are compacted only outside that
//! window. Compression fills `compressed` and never touches
//! `content`, so the full history stays available for persistence and
//! compressing twice yields the same result.

use serde::{Deserialize, Serialize};

use crate::core::types::{ConversationMessage, EnvironmentTurn, MessageBody, PlannerTurn, Role};

/// Placeholder rendered in place of compacted tool arguments.
pub const COMPACTED: &str = "[compacted]";

/// History retention settings (`[context]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Environment turns that keep their full state rendering (K >= 1).
    pub state_window_turns: usize,
    /// Planner turns that keep full tool arguments; 0 keeps all.
    pub action_detail_turns: usize,
    /// Environment turns retained at all; 0 retains all.
    pub max_history_turns: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            state_window_turns: 1,
            action_detail_turns: 0,
            max_history_turns: 0,
        }
    }
}

/// Compress `history` for the next planner request.
pub fn compress(
    history: &[ConversationMessage],
    config: &CompressionConfig,
) -> Vec<ConversationMessage> {
    let mut messages = elide(history, config.max_history_turns);

    let window = config.state_window_turns.max(1);
    let environment: Vec<usize> = positions(&messages, Role::Environment);
    let stale = environment.len().saturating_sub(window);
    for &index in &environment[..stale] {
        let message = &mut messages[index];
        if let MessageBody::Environment(turn) = message.effective() {
            let condensed = EnvironmentTurn {
                sequence: turn.sequence,
                previous: turn.previous.as_ref().map(|summary| summary.condensed()),
                state: None,
            };
            message.compressed = Some(MessageBody::Environment(condensed));
        }
    }

    // Messages from the first windowed environment turn on stay verbatim.
    let window_start = environment.get(stale).copied().unwrap_or(0);
    if config.action_detail_turns > 0 {
        let planner = positions(&messages, Role::Planner);
        let stale = planner.len().saturating_sub(config.action_detail_turns);
        for &index in planner[..stale].iter().filter(|&&index| index < window_start) {
            let message = &mut messages[index];
            if let MessageBody::Planner(turn) = message.effective() {
                let compacted = PlannerTurn {
                    arguments: None,
                    ..turn.clone()
                };
                message.compressed = Some(MessageBody::Planner(compacted));
            }
        }
    }

    messages
}

fn positions(messages: &[ConversationMessage], role: Role) -> Vec<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, message)| message.role == role)
        .map(|(index, _)| index)
        .collect()
}

/// Drop everything before the newest `max_turns` environment turns, leaving a
/// single marker that counts every turn ever dropped.
fn elide(history: &[ConversationMessage], max_turns: usize) -> Vec<ConversationMessage> {
    let environment = positions(history, Role::Environment);
    if max_turns == 0 || environment.len() <= max_turns {
        return history.to_vec();
    }
    let cutoff = environment[environment.len() - max_turns];
    let dropped = &history[..cutoff];
    let earlier: u64 = dropped
        .iter()
        .map(|message| match message.content {
            MessageBody::Elided { turns } => turns,
            _ => 0,
        })
        .sum();
    let newly = dropped
        .iter()
        .filter(|message| message.role == Role::Environment)
        .count() as u64;

    let mut messages = Vec::with_capacity(history.len() - cutoff + 1);
    messages.push(ConversationMessage::elided(
        dropped[0].ordinal,
        earlier + newly,
    ));
    messages.extend_from_slice(&history[cutoff..]);
    messages
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::types::{OutcomeStatus, TurnOutcome};

    fn history(turns: u64, state_size: usize) -> Vec<ConversationMessage> {
        let mut messages = Vec::new();
        let mut ordinal = 0;
        for sequence in 1..=turns {
            let previous = (sequence > 1).then(|| {
                TurnOutcome::observed("view_state", "x".repeat(state_size)).summary()
            });
            messages.push(ConversationMessage::environment(
                ordinal,
                EnvironmentTurn {
                    sequence,
                    previous,
                    state: Some("#".repeat(state_size)),
                },
            ));
            ordinal += 1;
            messages.push(ConversationMessage::planner(
                ordinal,
                PlannerTurn {
                    reasoning: format!("step {sequence}"),
                    tool: "run_code".to_string(),
                    arguments: Some(json!({ "code": "move(EAST);" })),
                },
            ));
            ordinal += 1;
        }
        messages
    }

    fn full_states(messages: &[ConversationMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m.effective(), MessageBody::Environment(t) if t.state.is_some()))
            .count()
    }

    /// Verifies only the newest state survives a long episode with K = 1.
    #[test]
    fn keeps_single_full_state() {
        let compressed = compress(&history(50, 64), &CompressionConfig::default());
        assert_eq!(compressed.len(), 100);
        assert_eq!(full_states(&compressed), 1);
        match compressed[98].effective() {
            MessageBody::Environment(turn) => {
                assert_eq!(turn.sequence, 50);
                assert!(turn.state.is_some());
            }
            other => panic!("unexpected body {other:?}"),
        }
        match compressed[0].effective() {
            MessageBody::Environment(turn) => assert_eq!(turn.state, None),
            other => panic!("unexpected body {other:?}"),
        }
    }

    /// Verifies compressing twice changes nothing.
    #[test]
    fn compression_is_idempotent() {
        let config = CompressionConfig {
            state_window_turns: 2,
            action_detail_turns: 3,
            max_history_turns: 10,
        };
        let once = compress(&history(20, 16), &config);
        assert_eq!(compress(&once, &config), once);
    }

    /// Verifies compressed turns do not grow with the state size.
    #[test]
    fn older_turns_are_bounded() {
        let size = |state_size: usize| {
            let compressed = compress(&history(10, state_size), &CompressionConfig::default());
            compressed[..compressed.len() - 2]
                .iter()
                .map(|m| serde_json::to_string(m.effective()).expect("json").len())
                .sum::<usize>()
        };
        assert_eq!(size(10), size(10_000));
    }

    /// Verifies nothing is compressed while the window covers every turn.
    #[test]
    fn short_history_is_verbatim() {
        let messages = history(3, 8);
        let config = CompressionConfig {
            state_window_turns: 5,
            ..CompressionConfig::default()
        };
        assert_eq!(compress(&messages, &config), messages);
    }

    /// Verifies argument compaction leaves the recent window alone.
    #[test]
    fn recent_window_is_verbatim() {
        let messages = history(3, 8);
        let config = CompressionConfig {
            state_window_turns: 5,
            action_detail_turns: 1,
            ..CompressionConfig::default()
        };
        assert_eq!(compress(&messages, &config), messages);

        let config = CompressionConfig {
            state_window_turns: 2,
            action_detail_turns: 1,
            ..CompressionConfig::default()
        };
        let compressed = compress(&messages, &config);
        let compacted: Vec<usize> = compressed
            .iter()
            .enumerate()
            .filter(|(_, m)| matches!(m.effective(), MessageBody::Planner(t) if t.arguments.is_none()))
            .map(|(index, _)| index)
            .collect();
        assert_eq!(compacted, vec![1]);
    }

    /// Verifies compaction drops arguments but keeps reasoning.
    #[test]
    fn compaction_keeps_reasoning() {
        let config = CompressionConfig {
            action_detail_turns: 1,
            ..CompressionConfig::default()
        };
        let compressed = compress(&history(3, 8), &config);
        match compressed[1].effective() {
            MessageBody::Planner(turn) => {
                assert_eq!(turn.reasoning, "step 1");
                assert_eq!(turn.arguments, None);
            }
            other => panic!("unexpected body {other:?}"),
        }
        match compressed[5].effective() {
            MessageBody::Planner(turn) => assert!(turn.arguments.is_some()),
            other => panic!("unexpected body {other:?}"),
        }
    }

    /// Verifies the elision marker is stable and accumulates dropped turns.
    #[test]
    fn elision_marker_accumulates() {
        let config = CompressionConfig {
            max_history_turns: 4,
            ..CompressionConfig::default()
        };
        let compressed = compress(&history(10, 8), &config);
        assert_eq!(compressed[0].content, MessageBody::Elided { turns: 6 });
        assert_eq!(compressed[0].ordinal, 0);
        assert_eq!(compressed.len(), 1 + 8);

        let mut extended = compressed.clone();
        let mut more = history(12, 8).split_off(20);
        extended.append(&mut more);
        let again = compress(&extended, &config);
        assert_eq!(again[0].content, MessageBody::Elided { turns: 8 });
        assert_eq!(again[0].ordinal, 0);
        assert_eq!(compress(&again, &config), again);
    }

    /// Verifies condensed summaries drop bulky observations.
    #[test]
    fn condensed_summary_drops_observation() {
        let compressed = compress(&history(3, 8), &CompressionConfig::default());
        match compressed[2].effective() {
            MessageBody::Environment(turn) => {
                let previous = turn.previous.as_ref().expect("previous");
                assert_eq!(previous.status, OutcomeStatus::Success);
                assert_eq!(previous.observation, None);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }
}
