//! System prompt rendering for the generation backend.

use crate::llm::REACTION_LABELS;
use crate::model::User;
use chrono::{Local, Utc};
use serde_json::json;

/// Current date and time in UTC and local time, so the model knows "now".
pub fn datetime_context() -> String {
    let utc_now = Utc::now();
    let local_now = Local::now();

    format!(
        "Current date/time: {}, {} UTC ({})\nLocal time: {}, {} ({})",
        utc_now.format("%A, %B %d, %Y"),
        utc_now.format("%H:%M:%S"),
        utc_now.to_rfc3339(),
        local_now.format("%A, %B %d, %Y"),
        local_now.format("%H:%M:%S %Z"),
        local_now.to_rfc3339()
    )
}

fn members_json(members: &[User]) -> String {
    let members: Vec<_> = members
        .iter()
        .map(|member| {
            json!({
                "id": member.id,
                "first_name": member.first_name,
                "last_name": member.last_name,
                "handle": member.handle,
            })
        })
        .collect();
    serde_json::to_string_pretty(&members).unwrap_or_else(|_| "[]".to_string())
}

pub fn generate_prompt(members: &[User], bot_name: &str, identity: &str) -> String {
    format!(
        "**Your name is {name}.**\n\n\
         Your identity:\n\n\
         {identity}\n\n\
         Below is a list of chat members and their associated information:\n\n\
         {members}\n\n\
         {now}\n\n\
         Response Model:\n\n\
         - message: The message text to send in response.\n\
         - reaction: Pick the most appropriate emoji to react to the last message with. Valid options: {reactions}.\n\
         - reaction_strength: A float between 0 and 1 indicating how strongly you react to the last message.\n",
        name = bot_name,
        identity = identity.trim(),
        members = members_json(members),
        now = datetime_context(),
        reactions = REACTION_LABELS.join(", "),
    )
}
