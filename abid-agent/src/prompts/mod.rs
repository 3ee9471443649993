use crate::clients::ToolDefinition;

/// Prefix of the synthesized message that stands in for compacted history.
pub const SUMMARY_MARKER: &str = "[CONTEXT SUMMARY]";

/// Prefix of the corrective message injected after a detected loop.
pub const LOOP_MARKER: &str = "[LOOP DETECTED]";

pub fn build_system_prompt(
    tools: &[ToolDefinition],
    cwd: &str,
    developer_instructions: Option<&str>,
    user_instructions: Option<&str>,
) -> String {
    let tools_section = if tools.is_empty() {
        "You have no tools available.".to_string()
    } else {
        let lines: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        format!(
            "You can call these tools through the function-calling interface:\n{}",
            lines.join("\n")
        )
    };

    let mut prompt = format!(
        r#"You are an expert programming assistant working inside a user's repository.

## Working directory
{cwd}

## Tools
{tools_section}

## Guidelines
1. Read before you write; search before you create.
2. Prefer small, verifiable steps and check the result of each tool call.
3. When a tool fails, read the error and adjust instead of repeating the same call.
4. When the task is done, answer in plain text without calling more tools."#
    );

    if let Some(instructions) = developer_instructions.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\n## Developer instructions\n");
        prompt.push_str(instructions.trim());
    }
    if let Some(instructions) = user_instructions.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\n## User instructions\n");
        prompt.push_str(instructions.trim());
    }
    prompt
}

/// Instruction appended to a flattened transcript when asking for a summary.
pub fn compression_prompt() -> &'static str {
    r#"Summarize the conversation above so that work can continue from the summary alone.
Use exactly these sections:

GOAL: what the user ultimately wants.
COMPLETED: what has been done so far, including files touched.
CURRENT STATE: where things stand right now, including open errors.
REMAINING: what is still left to do.
NEXT STEP: the single next action to take.
CONTEXT: names, paths, commands and decisions that must not be forgotten.

Be specific and terse. Do not invent progress that did not happen."#
}

pub fn build_summary_message(summary: &str) -> String {
    format!(
        "{SUMMARY_MARKER}\nEarlier parts of this conversation were compacted. Summary:\n\n{}",
        summary.trim()
    )
}

pub fn loop_breaker_prompt(description: &str) -> String {
    format!(
        r#"{LOOP_MARKER} {description}

You are repeating yourself. Stop and reconsider:
- What did the previous attempts return, and why did they not move the task forward?
- Try a different tool, different arguments, or a different approach.
- If the task is already complete or cannot be done, say so plainly."#
    )
}
