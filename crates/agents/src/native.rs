//! NativeThinking controller: provider-native reasoning plus native
//! function calling, tool calls still routed through the MCP client.

use async_trait::async_trait;

use tarsy_domain::conversation::{Conversation, Message};
use tarsy_domain::event::StreamType;
use tarsy_domain::interaction::InteractionType;
use tarsy_llm::{LlmRequest, ToolDefinition};

use crate::context::StageContext;
use crate::controller::IterationController;
use crate::prompts;
use crate::{AgentError, AgentResult, PauseCapture};

/// Separator used to flatten `<server>.<tool>` into a provider-legal
/// function name.
const TOOL_NAME_SEPARATOR: &str = "__";

pub struct NativeThinkingController;

impl NativeThinkingController {
    fn tool_definitions(ctx: &StageContext) -> Vec<ToolDefinition> {
        ctx.available_tools
            .iter()
            .map(|(server, tool)| ToolDefinition {
                name: format!("{server}{TOOL_NAME_SEPARATOR}{}", tool.name),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect()
    }

    fn llm_request(
        ctx: &StageContext,
        conversation: Conversation,
        tools: Vec<ToolDefinition>,
        iteration: u32,
    ) -> LlmRequest {
        let mut request = LlmRequest::investigation(&ctx.session_id, conversation);
        request.stage_execution_id = Some(ctx.execution_id.clone());
        request.provider = ctx.config.llm_provider.clone();
        request.tools = tools;
        request.thinking = true;
        request.parallel = ctx.parallel.clone();
        request.stream_type = StreamType::NativeThinking;
        request.step_description = format!("native-thinking iteration {iteration}");
        request
    }
}

#[async_trait]
impl IterationController for NativeThinkingController {
    fn needs_mcp_tools(&self) -> bool {
        true
    }

    async fn execute_analysis_loop(&self, ctx: &mut StageContext) -> AgentResult<String> {
        let tools = Self::tool_definitions(ctx);
        let mut conversation = match ctx.resume_conversation.take() {
            Some(captured) => captured,
            None => [
                Message::system(prompts::build_system_prompt(ctx, &[], false)),
                Message::user(prompts::build_task_prompt(ctx)),
            ]
            .into_iter()
            .collect(),
        };
        let mut iteration = ctx.resume_iteration.take().unwrap_or(0);
        // Resume grants a fresh window on top of the paused count.
        let iteration_cap = iteration + ctx.config.max_iterations;

        loop {
            ctx.check_cancelled()?;

            if iteration >= iteration_cap {
                if !ctx.config.force_conclusion_at_max_iterations {
                    return Err(AgentError::Paused(PauseCapture {
                        conversation,
                        current_iteration: iteration,
                    }));
                }
                conversation.push(Message::user(prompts::FORCED_CONCLUSION_PROMPT));
                // No tools on the conclusion turn: the model must answer.
                let mut request = Self::llm_request(ctx, conversation, Vec::new(), iteration);
                request.interaction_type = InteractionType::FinalAnswer;
                let updated = ctx.llm.generate_response(request).await?;
                return Ok(updated
                    .latest_assistant()
                    .map(|m| m.content.clone())
                    .unwrap_or_default());
            }
            iteration += 1;
            ctx.current_iteration = iteration;

            let request = Self::llm_request(ctx, conversation.clone(), tools.clone(), iteration);
            conversation = ctx.llm.generate_response(request).await?;

            let assistant = conversation
                .latest_assistant()
                .cloned()
                .unwrap_or_else(|| Message::assistant(""));
            if assistant.tool_calls.is_empty() {
                return Ok(assistant.content);
            }

            for call in &assistant.tool_calls {
                ctx.check_cancelled()?;
                let (server, tool) = call
                    .name
                    .split_once(TOOL_NAME_SEPARATOR)
                    .unwrap_or(("", call.name.as_str()));
                let content = if server.is_empty() {
                    format!("tool call failed: unknown tool '{}'", call.name)
                } else {
                    match ctx
                        .mcp
                        .call_tool(
                            server,
                            tool,
                            call.arguments.clone(),
                            Some(&ctx.execution_id),
                            Some(&conversation),
                            ctx.max_result_tokens(),
                        )
                        .await
                    {
                        Ok(result) => result["result"]
                            .as_str()
                            .map(String::from)
                            .unwrap_or_else(|| result.to_string()),
                        Err(e) => format!("tool call failed: {e}"),
                    }
                };
                conversation.push(Message::tool(content, call.id.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarsy_mcp::McpTool;

    #[test]
    fn tool_names_flatten_server_and_tool() {
        let tool: McpTool = serde_json::from_value(serde_json::json!({
            "name": "get_pods",
            "description": "List pods"
        }))
        .unwrap();
        let name = format!("kubernetes{TOOL_NAME_SEPARATOR}{}", tool.name);
        assert_eq!(name, "kubernetes__get_pods");
        let (server, tool_name) = name.split_once(TOOL_NAME_SEPARATOR).unwrap();
        assert_eq!(server, "kubernetes");
        assert_eq!(tool_name, "get_pods");
    }
}
