//! Prompt assembly for the iteration controllers.

use crate::context::{ChainContext, StageContext};

/// ReAct format contract appended to the system prompt of ReAct agents.
pub const REACT_FORMAT_INSTRUCTIONS: &str = r#"Answer using this exact format:

Thought: reason about what you know and what to check next
Action: <server>.<tool>
Action Input: <arguments as YAML key: value pairs; lists as YAML lists>
Observation: (the tool result will be inserted here)

Repeat Thought/Action/Action Input/Observation as needed. When you have
enough information, finish with:

Thought: I now know the final answer
Final Answer: the complete diagnosis and recommended remediation"#;

/// Injected when the loop hits its iteration cap with force-conclusion on.
pub const FORCED_CONCLUSION_PROMPT: &str = "You have reached the maximum number of \
investigation steps. Do not request any more tools. Based on everything observed so \
far, provide your best final assessment now, starting with 'Final Answer:'.";

/// System prompt: base role + per-server instructions + agent custom
/// instructions (+ ReAct format for ReAct agents).
pub fn build_system_prompt(ctx: &StageContext, server_instructions: &[String], react: bool) -> String {
    let mut sections = vec![format!(
        "You are {}, an expert site-reliability investigator responding to a '{}' alert. \
         Investigate the alert using the tools available and produce a precise, \
         actionable analysis.",
        ctx.agent.name, ctx.chain.alert_type
    )];
    for instructions in server_instructions {
        if !instructions.trim().is_empty() {
            sections.push(instructions.clone());
        }
    }
    if let Some(custom) = &ctx.agent.custom_instructions {
        sections.push(custom.clone());
    }
    if react {
        sections.push(REACT_FORMAT_INSTRUCTIONS.to_string());
    }
    sections.join("\n\n")
}

/// The opening user message: alert payload, runbook pointer, prior stage
/// outputs, and the available tools.
pub fn build_task_prompt(ctx: &StageContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Alert: {}\n\n", ctx.chain.alert_type));
    out.push_str("## Alert data\n```json\n");
    out.push_str(
        &serde_json::to_string_pretty(&ctx.chain.alert_data).unwrap_or_else(|_| "{}".into()),
    );
    out.push_str("\n```\n");

    if let Some(runbook) = &ctx.chain.runbook_url {
        out.push_str(&format!("\n## Runbook\n{runbook}\n"));
    }

    if ctx.chain.has_results() {
        out.push_str("\n## Previous stage results\n");
        out.push_str(&format_stage_results(&ctx.chain));
    }

    if !ctx.available_tools.is_empty() {
        out.push_str("\n## Available tools\n");
        for (server, tool) in &ctx.available_tools {
            out.push_str(&format!("- {server}.{}: {}\n", tool.name, tool.description));
        }
    }

    out.push_str(&format!(
        "\nInvestigate this alert as stage '{}' of the response chain.\n",
        ctx.stage_name
    ));
    out
}

/// Prior stage outputs rendered for synthesis and task prompts.
pub fn format_stage_results(chain: &ChainContext) -> String {
    let mut out = String::new();
    for (stage_name, output) in chain.ordered_results() {
        out.push_str(&format!("### {stage_name}\n"));
        match output.get("analysis").and_then(|v| v.as_str()) {
            Some(analysis) => out.push_str(analysis),
            None => out.push_str(
                &serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string()),
            ),
        }
        out.push('\n');
    }
    out
}

/// The synthesis stage's single-call prompt over sibling/prior outputs.
pub fn build_synthesis_prompt(ctx: &StageContext) -> String {
    format!(
        "Multiple investigation agents analyzed the '{}' alert below. Synthesize their \
         findings into one unified analysis: reconcile contradictions, rank root causes \
         by likelihood, and give a single remediation plan.\n\n## Alert data\n```json\n{}\n```\n\n\
         ## Investigation outputs\n{}",
        ctx.chain.alert_type,
        serde_json::to_string_pretty(&ctx.chain.alert_data).unwrap_or_else(|_| "{}".into()),
        format_stage_results(&ctx.chain)
    )
}

/// Bounded executive summary over the final analysis.
pub fn build_executive_summary_prompt(final_analysis: &str, max_tokens: u32) -> String {
    format!(
        "Summarize the incident analysis below for an executive notification. \
         At most {max_tokens} tokens. Lead with impact and the recommended action.\n\n{final_analysis}"
    )
}

/// Observation line appended after a tool call in the ReAct loop.
pub fn format_observation(result: &serde_json::Value) -> String {
    let text = match result.get("result").and_then(|v| v.as_str()) {
        Some(text) => text.to_string(),
        None => serde_json::to_string(result).unwrap_or_else(|_| result.to_string()),
    };
    format!("Observation: {text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_prefers_result_key() {
        let value = serde_json::json!({"result": "3 pods running", "is_error": false});
        assert_eq!(format_observation(&value), "Observation: 3 pods running");
    }

    #[test]
    fn observation_falls_back_to_full_json() {
        let value = serde_json::json!({"weird": true});
        assert!(format_observation(&value).contains("weird"));
    }

    #[test]
    fn stage_results_render_analysis_text() {
        let mut chain = ChainContext::default();
        chain.add_stage_result(
            "initial-analysis",
            "exec-1",
            serde_json::json!({"analysis": "the disk is full"}),
        );
        let rendered = format_stage_results(&chain);
        assert!(rendered.contains("### initial-analysis"));
        assert!(rendered.contains("the disk is full"));
    }
}
