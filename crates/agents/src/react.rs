//! ReAct controller: alternating LLM turns and tool calls.
//!
//! Each assistant message is parsed as either a
//! `Thought: / Action: / Action Input:` block or a `Final Answer:`.
//! Action inputs are parsed as YAML first (so lists survive intact),
//! falling back to a flat `key: value` parser on malformed YAML.

use async_trait::async_trait;
use serde_json::Value;

use tarsy_domain::conversation::{Conversation, Message};
use tarsy_domain::event::StreamType;
use tarsy_domain::interaction::InteractionType;
use tarsy_llm::LlmRequest;

use crate::context::StageContext;
use crate::controller::IterationController;
use crate::prompts;
use crate::{AgentError, AgentResult, PauseCapture};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum ReactTurn {
    ToolCall {
        thought: Option<String>,
        server: String,
        tool: String,
        arguments: Value,
    },
    FinalAnswer {
        answer: String,
    },
    Malformed {
        reason: String,
    },
}

/// Parse one assistant message. When both markers appear, whichever comes
/// first in the text wins.
pub fn parse_react_turn(text: &str) -> ReactTurn {
    let final_pos = find_marker(text, "Final Answer:");
    let action_pos = find_marker(text, "Action:");

    match (final_pos, action_pos) {
        (Some(f), Some(a)) if f < a => final_answer_at(text, f),
        (Some(f), None) => final_answer_at(text, f),
        (None, Some(a)) | (Some(_), Some(a)) => parse_action_at(text, a),
        (None, None) => ReactTurn::Malformed {
            reason: "no Action or Final Answer found".into(),
        },
    }
}

/// Byte offset of a marker at the start of a line (leading whitespace
/// allowed).
fn find_marker(text: &str, marker: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with(marker) {
            return Some(offset + (line.len() - trimmed.len()));
        }
        offset += line.len();
    }
    None
}

fn final_answer_at(text: &str, pos: usize) -> ReactTurn {
    let answer = text[pos + "Final Answer:".len()..].trim().to_string();
    ReactTurn::FinalAnswer { answer }
}

fn parse_action_at(text: &str, pos: usize) -> ReactTurn {
    let thought = find_marker(text, "Thought:").filter(|&t| t < pos).map(|t| {
        text[t + "Thought:".len()..pos].trim().to_string()
    });

    let after_action = &text[pos + "Action:".len()..];
    let action_line = after_action.lines().next().unwrap_or("").trim();
    let Some((server, tool)) = action_line.split_once('.') else {
        return ReactTurn::Malformed {
            reason: format!("action '{action_line}' is not in <server>.<tool> form"),
        };
    };

    let input_text = find_marker(after_action, "Action Input:")
        .map(|p| {
            let raw = &after_action[p + "Action Input:".len()..];
            // The input runs to the next marker (an Observation echo or a
            // stray Thought) or the end of the message.
            let end = find_marker(raw, "Observation:")
                .into_iter()
                .chain(find_marker(raw, "Thought:"))
                .min()
                .unwrap_or(raw.len());
            raw[..end].trim().to_string()
        })
        .unwrap_or_default();

    ReactTurn::ToolCall {
        thought,
        server: server.trim().to_string(),
        tool: tool.trim().to_string(),
        arguments: parse_action_input(&input_text),
    }
}

/// YAML first (lists and nesting preserved), flat `key: value` fallback.
/// Never panics on malformed input.
pub fn parse_action_input(input: &str) -> Value {
    if input.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    if let Ok(yaml) = serde_yaml::from_str::<serde_yaml::Value>(input) {
        if yaml.is_mapping() {
            if let Ok(value) = serde_json::to_value(&yaml) {
                return value;
            }
        }
    }
    parse_flat_input(input)
}

/// `key: value` pairs split on newlines and commas; values stay strings.
fn parse_flat_input(input: &str) -> Value {
    let mut map = serde_json::Map::new();
    for piece in input.lines().flat_map(|line| line.split(',')) {
        if let Some((key, value)) = piece.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                map.insert(key.to_string(), Value::String(value.trim().to_string()));
            }
        }
    }
    Value::Object(map)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReactController;

impl ReactController {
    fn initial_conversation(&self, ctx: &StageContext) -> Conversation {
        let server_instructions: Vec<String> = ctx
            .available_tools
            .iter()
            .map(|(server, _)| server.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|server| format!("Tools from the '{server}' server are available."))
            .collect();
        [
            Message::system(prompts::build_system_prompt(ctx, &server_instructions, true)),
            Message::user(prompts::build_task_prompt(ctx)),
        ]
        .into_iter()
        .collect()
    }

    fn llm_request(&self, ctx: &StageContext, conversation: Conversation, iteration: u32) -> LlmRequest {
        let mut request = LlmRequest::investigation(&ctx.session_id, conversation);
        request.stage_execution_id = Some(ctx.execution_id.clone());
        request.provider = ctx.config.llm_provider.clone();
        request.parallel = ctx.parallel.clone();
        request.stream_type = StreamType::Thought;
        request.step_description = format!("ReAct iteration {iteration}");
        request
    }
}

#[async_trait]
impl IterationController for ReactController {
    fn needs_mcp_tools(&self) -> bool {
        true
    }

    async fn execute_analysis_loop(&self, ctx: &mut StageContext) -> AgentResult<String> {
        let mut conversation = match ctx.resume_conversation.take() {
            Some(captured) => captured,
            None => self.initial_conversation(ctx),
        };
        let mut iteration = ctx.resume_iteration.take().unwrap_or(0);
        // A resumed stage gets a fresh iteration window on top of where it
        // paused; otherwise it would re-pause before doing anything.
        let iteration_cap = iteration + ctx.config.max_iterations;

        loop {
            ctx.check_cancelled()?;

            if iteration >= iteration_cap {
                if !ctx.config.force_conclusion_at_max_iterations {
                    tracing::info!(
                        session_id = %ctx.session_id,
                        stage_id = %ctx.stage_id,
                        iteration,
                        "max iterations reached, pausing stage"
                    );
                    return Err(AgentError::Paused(PauseCapture {
                        conversation,
                        current_iteration: iteration,
                    }));
                }
                // Forced conclusion: one more turn, treated as the final
                // answer whatever it contains.
                conversation.push(Message::user(prompts::FORCED_CONCLUSION_PROMPT));
                let mut request = self.llm_request(ctx, conversation, iteration);
                request.interaction_type = InteractionType::FinalAnswer;
                request.stream_type = StreamType::FinalAnswer;
                let updated = ctx.llm.generate_response(request).await?;
                let content = latest_assistant_text(&updated);
                return Ok(match parse_react_turn(&content) {
                    ReactTurn::FinalAnswer { answer } => answer,
                    _ => content,
                });
            }
            iteration += 1;
            ctx.current_iteration = iteration;

            let request = self.llm_request(ctx, conversation.clone(), iteration);
            match ctx.llm.generate_response(request).await {
                Ok(updated) => conversation = updated,
                Err(e) => {
                    // Provider hiccups become an observation; the loop
                    // continues under the same iteration budget.
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        error = %e,
                        "LLM call failed inside ReAct loop, continuing with error observation"
                    );
                    conversation.push(Message::user(format!(
                        "Observation: the reasoning model returned an error ({e}). Continue."
                    )));
                    continue;
                }
            }

            let content = latest_assistant_text(&conversation);
            match parse_react_turn(&content) {
                ReactTurn::FinalAnswer { answer } => return Ok(answer),
                ReactTurn::ToolCall {
                    server,
                    tool,
                    arguments,
                    ..
                } => {
                    ctx.check_cancelled()?;
                    let observation = match ctx
                        .mcp
                        .call_tool(
                            &server,
                            &tool,
                            arguments,
                            Some(&ctx.execution_id),
                            Some(&conversation),
                            ctx.max_result_tokens(),
                        )
                        .await
                    {
                        Ok(result) => prompts::format_observation(&result),
                        Err(e) => format!("Observation: tool call failed: {e}"),
                    };
                    conversation.push(Message::user(observation));
                }
                ReactTurn::Malformed { reason } => {
                    conversation.push(Message::user(format!(
                        "Your response could not be parsed ({reason}). Reply with a \
                         Thought/Action/Action Input block or a Final Answer, exactly \
                         as specified."
                    )));
                }
            }
        }
    }
}

fn latest_assistant_text(conversation: &Conversation) -> String {
    conversation
        .latest_assistant()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
