use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::config::{AgentProfile, CycleConfig};
use crate::forum::ItemId;

const MAX_SEEN_IDS_IN_PROMPT: usize = 50;

/// Per-turn user prompt: when the agent last took part and which threads it
/// has already been shown.
pub fn build_turn_prompt(last_run: Option<DateTime<Utc>>, seen: &HashSet<ItemId>) -> String {
    let time_info = match last_run {
        Some(ts) => format!("You last participated at {}.", ts.to_rfc3339()),
        None => "This is your first participation.".to_string(),
    };

    let seen_info = if seen.is_empty() {
        "You have not seen any threads yet.".to_string()
    } else {
        let mut ids: Vec<ItemId> = seen.iter().copied().collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let shown: Vec<String> = ids
            .iter()
            .take(MAX_SEEN_IDS_IN_PROMPT)
            .map(|id| id.to_string())
            .collect();
        let more = ids.len().saturating_sub(MAX_SEEN_IDS_IN_PROMPT);
        let suffix = if more > 0 {
            format!(" (and {} older)", more)
        } else {
            String::new()
        };
        format!(
            "Threads you have already seen: {}{}. Threads not in this list, or with new \
             activity since your last participation, are new to you.",
            shown.join(", "),
            suffix
        )
    };

    format!(
        "You are participating in a collaborative forum discussion.\n\n\
         {time_info}\n{seen_info}\n\n\
         Your role:\n\
         1. Use list_forum_threads to see what is being discussed\n\
         2. Read new or interesting threads with read_forum_thread, \
         or find topics with search_forum\n\
         3. Decide whether to reply to an existing thread, start a new one, or skip this cycle\n\
         4. Answer with your structured decision\n\n\
         Guidelines:\n\
         - Only participate if you have something meaningful to contribute\n\
         - Don't just echo what others have said\n\
         - If nothing interests you this cycle, it's OK to skip"
    )
}

/// Persona prompt plus an upfront disclosure of the limits the agent runs under
/// and the exact answer format the invoker will parse.
pub fn build_system_prompt(agent: &AgentProfile, cycle: &CycleConfig, model: &str) -> String {
    format!(
        "{persona}\n\n\
         ---\n\
         SYSTEM CONSTRAINTS:\n\n\
         1. TOOL CALLS: You can make at most {max_calls} tool calls this turn. \
         If you exceed this, your turn is interrupted and recorded as a skip.\n\
         2. CYCLE TIMING: Agents take turns roughly every {minutes} minutes. Each cycle you \
         have a {skip_pct:.0}% chance to sit out.\n\
         3. MODEL: You are running on {model}.\n\
         4. RANDOMIZATION: Agent order and participation are randomized every cycle, so no \
         participant has a positional advantage.\n\n\
         ---\n\
         ANSWER FORMAT:\n\
         When you are done using tools, reply with a single JSON object and nothing else:\n\
         {{\"action\": \"skip\" | \"start_topic\" | \"reply\", \
         \"target\": <thread id, required for reply>, \
         \"title\": <string, required for start_topic>, \
         \"body\": <string>, \
         \"rationale\": <why you chose this>}}\n\
         You post as \"{name}\"; do not sign your messages.",
        persona = agent.system_prompt.trim(),
        max_calls = cycle.max_tool_calls,
        minutes = cycle.cycle_interval_secs / 60,
        skip_pct = cycle.skip_probability * 100.0,
        model = model,
        name = agent.display_name(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_turn_prompt_mentions_first_participation() {
        let prompt = build_turn_prompt(None, &HashSet::new());
        assert!(prompt.contains("first participation"));
        assert!(prompt.contains("not seen any threads"));
    }

    #[test]
    fn seen_ids_are_listed_newest_first_and_capped() {
        let seen: HashSet<ItemId> = (1..=60).collect();
        let prompt = build_turn_prompt(Some(Utc::now()), &seen);
        assert!(prompt.contains("already seen: 60, 59"));
        assert!(prompt.contains("(and 10 older)"));
        assert!(prompt.contains("last participated"));
    }

    #[test]
    fn system_prompt_discloses_budget() {
        let agent = AgentProfile::named("opus");
        let cycle = CycleConfig {
            max_tool_calls: 7,
            ..CycleConfig::default()
        };
        let prompt = build_system_prompt(&agent, &cycle, "llama3.2");
        assert!(prompt.contains("at most 7 tool calls"));
        assert!(prompt.contains("20% chance"));
        assert!(prompt.contains("\"opus\""));
    }
}
