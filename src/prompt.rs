//! System prompt assembly. Everything the model needs to stay in character
//! and to emit scheduling directives lives here; nothing in this module
//! touches the store or the network.

use crate::persona::{Persona, Status};
use crate::timemath::TimeContext;

/// How directive output is requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveStyle {
    /// Structured tool calls; no tag instructions in the prompt.
    Tools,
    /// Compact inline tags described in the prompt.
    InlineTags,
}

pub fn system_prompt(
    persona: &Persona,
    time: &TimeContext,
    status: Option<&Status>,
    style: DirectiveStyle,
) -> String {
    let mut prompt = format!(
        "You are {name}. You are a real person living your own life, chatting \
         through {medium}. You are not an assistant and you never break character.\n\n",
        name = persona.name,
        medium = if persona.connection.medium.is_empty() {
            "a messaging app"
        } else {
            &persona.connection.medium
        },
    );

    if !persona.world.description.is_empty() {
        prompt.push_str(&format!(
            "## Your world: {}\n{}\n\n",
            persona.world.name, persona.world.description
        ));
    }
    if !persona.character.background.is_empty() {
        prompt.push_str(&format!("## Background\n{}\n\n", persona.character.background));
    }
    if !persona.character.personality.is_empty() {
        prompt.push_str(&format!(
            "## Personality\n{}\n\n",
            persona.character.personality
        ));
    }
    if !persona.character.speech_style.is_empty() {
        prompt.push_str(&format!(
            "## How you write\n{}\n\n",
            persona.character.speech_style
        ));
    }
    if !persona.connection.medium_description.is_empty() {
        prompt.push_str(&format!(
            "## The connection\n{}\n\n",
            persona.connection.medium_description
        ));
    }

    prompt.push_str(&format!("## Time\n{}\n\n", time.context));

    if let Some(status) = status {
        prompt.push_str(&format!("## Right now\nYou are: {}", status.label));
        if let Some(reason) = &status.reason {
            prompt.push_str(&format!(" ({})", reason));
        }
        prompt.push_str("\n\n");
    }

    if !persona.schedule.routine.is_empty() && persona.schedule.enabled {
        prompt.push_str("## Your daily routine\n");
        for slot in &persona.schedule.routine {
            prompt.push_str(&format!("- {}: {}-{}\n", slot.label, slot.start, slot.end));
        }
        prompt.push('\n');
    }

    match style {
        DirectiveStyle::Tools => {
            prompt.push_str(
                "## Scheduling\nAfter replying, use the set_next_contact tool to decide \
                 when you will next message first. Use set_status when you start or stop \
                 doing something that affects your availability, and modify_schedule when \
                 your routine changes.\n",
            );
        }
        DirectiveStyle::InlineTags => {
            prompt.push_str(
                "## Scheduling\nEnd your reply with control tags (they are stripped \
                 before display):\n\
                 - `<nc:30m:reason>` schedules your next unprompted message (units s/m/h). \
                 `<nc!:...>` makes it survive them messaging you first. Include one after \
                 every reply.\n\
                 - `<st:label:2h|noreply>` declares what you are doing; options `noreply`, \
                 `delay:min-max` (seconds), `chance:0.5`. `<st:clear>` ends it.\n\
                 - `<sch:add:label:HH:MM-HH:MM|noreply>` / `<sch:set:...>` / \
                 `<sch:remove:label>` edit your routine.\n",
            );
        }
    }

    prompt
}

/// The synthetic user turn injected when the persona reaches out on its own.
/// `reason` is whatever the model gave when it scheduled the contact.
pub fn proactive_trigger(reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!(
            "[The other person has not said anything. You decided earlier to reach out \
             now because: {}. Send them a message.]",
            reason
        ),
        None => "[The other person has not said anything. You felt like reaching out. \
                 Send them a message.]"
            .to_string(),
    }
}
