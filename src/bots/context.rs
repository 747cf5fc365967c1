//! Assembly of a bot's working context for an engine run.
//!
//! The system prompt layers the bot's own prompt with a digest of its
//! recent journal, so a bot carries what it learned on earlier tasks
//! into the next one. Story-driven jobs additionally fold the story's
//! description and acceptance criteria into the instruction.

use crate::models::{Bot, JournalEntry, Story};

/// System prompt for an engine run on behalf of a bot.
pub fn system_prompt(bot: &Bot, journal: &[JournalEntry]) -> String {
    let mut prompt = String::new();

    if let Some(own) = &bot.system_prompt {
        prompt.push_str(own);
        prompt.push('\n');
    }

    if !journal.is_empty() {
        prompt.push_str("\nYour recent work journal (newest first):\n");
        for entry in journal {
            prompt.push_str(&format!(
                "- [{}] {}\n",
                entry.entry_type.as_str(),
                entry.summary
            ));
            if let Some(details) = &entry.details {
                prompt.push_str(&format!("  {}\n", details));
            }
        }
    }

    prompt.trim_end().to_string()
}

/// Engine instruction for a story: the title, plus whatever detail the
/// story carries.
pub fn story_instruction(story: &Story) -> String {
    let mut instruction = story.title.clone();
    if let Some(description) = &story.description {
        instruction.push_str("\n\n");
        instruction.push_str(description);
    }
    if let Some(criteria) = &story.acceptance_criteria {
        instruction.push_str("\n\nAcceptance criteria:\n");
        instruction.push_str(criteria);
    }
    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BotStatus, IdleBehavior, JournalEntryType};

    fn bot(prompt: Option<&str>) -> Bot {
        Bot {
            id: "bot-1".to_string(),
            name: "scribe".to_string(),
            project_id: "demo".to_string(),
            engine_type: "claude-code".to_string(),
            model: None,
            system_prompt: prompt.map(String::from),
            status: BotStatus::Idle,
            poll_interval_seconds: 30,
            max_concurrent_stories: 1,
            idle_behavior: IdleBehavior::Wait,
            created_at: "2025-01-01T00:00:00Z".to_string(),
            updated_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    fn entry(summary: &str, details: Option<&str>) -> JournalEntry {
        JournalEntry {
            id: "e-1".to_string(),
            bot_id: "bot-1".to_string(),
            job_id: None,
            story_id: None,
            entry_type: JournalEntryType::TaskCompleted,
            summary: summary.to_string(),
            details: details.map(String::from),
            created_at: "2025-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn prompt_layers_bot_prompt_and_journal() {
        let prompt = system_prompt(
            &bot(Some("You maintain the demo service.")),
            &[entry("Completed: fix login", Some("Patched session check"))],
        );
        assert!(prompt.starts_with("You maintain the demo service."));
        assert!(prompt.contains("recent work journal"));
        assert!(prompt.contains("Completed: fix login"));
        assert!(prompt.contains("Patched session check"));
    }

    #[test]
    fn prompt_without_journal_is_just_the_bot_prompt() {
        let prompt = system_prompt(&bot(Some("Keep it green.")), &[]);
        assert_eq!(prompt, "Keep it green.");
    }

    #[test]
    fn prompt_with_nothing_is_empty() {
        assert_eq!(system_prompt(&bot(None), &[]), "");
    }

    #[test]
    fn story_instruction_folds_in_details() {
        let story = Story {
            id: "s-1".to_string(),
            board_id: "b-1".to_string(),
            column_id: "c-1".to_string(),
            title: "Add healthcheck".to_string(),
            description: Some("Expose GET /health".to_string()),
            acceptance_criteria: Some("Returns 200 with build info".to_string()),
            priority: 1,
            position: 0,
            assignee: Some("bot-1".to_string()),
            assignee_type: Some(crate::models::AssigneeType::Bot),
            job_id: None,
            created_at: "2025-01-01T00:00:00Z".to_string(),
            updated_at: "2025-01-01T00:00:00Z".to_string(),
        };
        let instruction = story_instruction(&story);
        assert!(instruction.starts_with("Add healthcheck"));
        assert!(instruction.contains("GET /health"));
        assert!(instruction.contains("Acceptance criteria:"));
    }
}
