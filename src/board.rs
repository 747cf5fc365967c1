//! Kanban boards for bot-driven work.
//!
//! Each project gets one board. Bots watch the intake column for stories
//! assigned to them; a claimed story moves to "In Progress" while its job
//! runs, then to "Review" on success or back to intake on failure so a
//! human can amend it and try again.

use anyhow::{Context, Result};

use crate::db::DbHandle;
use crate::models::{AssigneeType, Board, Column, Story};

/// Default column layout for a new board. The last column is terminal:
/// stories there are finished and never picked up again.
pub const DEFAULT_COLUMNS: &[(&str, bool)] = &[
    ("Backlog", false),
    ("Todo", false),
    ("In Progress", false),
    ("Review", false),
    ("Done", true),
];

/// Column bots poll for work.
pub const INTAKE_COLUMN: &str = "Todo";
const IN_PROGRESS_COLUMN: &str = "In Progress";
const SUCCESS_COLUMN: &str = "Review";

pub struct BoardManager {
    db: DbHandle,
}

impl BoardManager {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// The project's board, created with the default columns on first use.
    pub async fn ensure_board(&self, project_id: &str) -> Result<Board> {
        let pid = project_id.to_string();
        if let Some(board) = self.db.call(move |db| db.get_board_by_project(&pid)).await? {
            return Ok(board);
        }
        let pid = project_id.to_string();
        self.db
            .call(move |db| db.create_board(&pid, &format!("{} board", pid), DEFAULT_COLUMNS))
            .await
            .context("Failed to create board")
    }

    pub async fn get_board(&self, board_id: &str) -> Result<Option<Board>> {
        let id = board_id.to_string();
        self.db.call(move |db| db.get_board(&id)).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_story(
        &self,
        board: &Board,
        column_name: &str,
        title: &str,
        description: Option<&str>,
        acceptance_criteria: Option<&str>,
        priority: i64,
        assignee: Option<&str>,
        assignee_type: Option<AssigneeType>,
    ) -> Result<Story> {
        let column = find_column(board, column_name)
            .with_context(|| format!("Board has no column named {}", column_name))?;

        let board_id = board.id.clone();
        let column_id = column.id.clone();
        let title = title.to_string();
        let description = description.map(String::from);
        let acceptance_criteria = acceptance_criteria.map(String::from);
        let assignee = assignee.map(String::from);
        self.db
            .call(move |db| {
                db.create_story(
                    &board_id,
                    &column_id,
                    &title,
                    description.as_deref(),
                    acceptance_criteria.as_deref(),
                    priority,
                    0,
                    assignee.as_deref(),
                    assignee_type,
                )
            })
            .await
    }

    pub async fn get_story(&self, story_id: &str) -> Result<Option<Story>> {
        let id = story_id.to_string();
        self.db.call(move |db| db.get_story(&id)).await
    }

    pub async fn move_story(&self, story_id: &str, column_id: &str) -> Result<()> {
        let sid = story_id.to_string();
        let cid = column_id.to_string();
        self.db.call(move |db| db.move_story(&sid, &cid)).await
    }

    /// Stories the bot may pick up, best first.
    pub async fn eligible_stories(&self, board: &Board, bot_id: &str) -> Result<Vec<Story>> {
        let Some(intake) = find_column(board, INTAKE_COLUMN) else {
            return Ok(Vec::new());
        };
        let column_id = intake.id.clone();
        let bot_id = bot_id.to_string();
        self.db
            .call(move |db| db.stories_for_bot(&column_id, &bot_id))
            .await
    }

    /// Mark a story claimed: link the job and move it to "In Progress".
    pub async fn story_started(&self, board: &Board, story_id: &str, job_id: &str) -> Result<()> {
        let sid = story_id.to_string();
        let jid = job_id.to_string();
        self.db.call(move |db| db.link_story_job(&sid, &jid)).await?;

        if let Some(column) = find_column(board, IN_PROGRESS_COLUMN) {
            self.move_story(story_id, &column.id).await?;
        }
        Ok(())
    }

    /// Completed job: move the story to "Review", or the terminal column
    /// if the board has no review stage.
    pub async fn story_succeeded(&self, board: &Board, story_id: &str) -> Result<()> {
        let target = find_column(board, SUCCESS_COLUMN)
            .or_else(|| board.columns.iter().find(|c| c.is_terminal))
            .context("Board has no review or terminal column")?;
        self.move_story(story_id, &target.id).await
    }

    /// Failed job: return the story to intake for another attempt.
    pub async fn story_failed(&self, board: &Board, story_id: &str) -> Result<()> {
        let target = find_column(board, INTAKE_COLUMN)
            .or_else(|| board.columns.first())
            .context("Board has no columns")?;
        self.move_story(story_id, &target.id).await
    }
}

pub fn find_column<'a>(board: &'a Board, name: &str) -> Option<&'a Column> {
    board.columns.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> BoardManager {
        BoardManager::new(DbHandle::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn ensure_board_creates_default_columns_once() {
        let mgr = manager().await;
        let board = mgr.ensure_board("demo").await.unwrap();
        assert_eq!(board.columns.len(), 5);
        assert_eq!(board.columns[0].name, "Backlog");
        assert!(board.columns[4].is_terminal);

        let again = mgr.ensure_board("demo").await.unwrap();
        assert_eq!(again.id, board.id);
    }

    #[tokio::test]
    async fn story_lifecycle_moves_through_columns() {
        let mgr = manager().await;
        let board = mgr.ensure_board("demo").await.unwrap();

        let story = mgr
            .create_story(
                &board,
                INTAKE_COLUMN,
                "Add healthcheck",
                Some("expose /health"),
                None,
                1,
                Some("bot-1"),
                Some(AssigneeType::Bot),
            )
            .await
            .unwrap();

        mgr.story_started(&board, &story.id, "job-1").await.unwrap();
        let claimed = mgr.get_story(&story.id).await.unwrap().unwrap();
        assert_eq!(claimed.job_id.as_deref(), Some("job-1"));
        assert_eq!(
            claimed.column_id,
            find_column(&board, "In Progress").unwrap().id
        );

        mgr.story_succeeded(&board, &story.id).await.unwrap();
        let done = mgr.get_story(&story.id).await.unwrap().unwrap();
        assert_eq!(done.column_id, find_column(&board, "Review").unwrap().id);
    }

    #[tokio::test]
    async fn failed_story_returns_to_intake() {
        let mgr = manager().await;
        let board = mgr.ensure_board("demo").await.unwrap();
        let story = mgr
            .create_story(&board, INTAKE_COLUMN, "Flaky", None, None, 1, Some("bot-1"), Some(AssigneeType::Bot))
            .await
            .unwrap();

        mgr.story_started(&board, &story.id, "job-1").await.unwrap();
        mgr.story_failed(&board, &story.id).await.unwrap();

        let back = mgr.get_story(&story.id).await.unwrap().unwrap();
        assert_eq!(back.column_id, find_column(&board, INTAKE_COLUMN).unwrap().id);
        // Eligible again for the next tick
        let eligible = mgr.eligible_stories(&board, "bot-1").await.unwrap();
        assert_eq!(eligible.len(), 1);
    }

    #[tokio::test]
    async fn eligible_stories_ignores_other_assignees() {
        let mgr = manager().await;
        let board = mgr.ensure_board("demo").await.unwrap();
        mgr.create_story(&board, INTAKE_COLUMN, "mine", None, None, 1, Some("bot-1"), Some(AssigneeType::Bot))
            .await
            .unwrap();
        mgr.create_story(&board, INTAKE_COLUMN, "theirs", None, None, 1, Some("bot-2"), Some(AssigneeType::Bot))
            .await
            .unwrap();
        mgr.create_story(&board, "Backlog", "not ready", None, None, 1, Some("bot-1"), Some(AssigneeType::Bot))
            .await
            .unwrap();

        let eligible = mgr.eligible_stories(&board, "bot-1").await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].title, "mine");
    }
}
