//! Task board: ordered columns and a flat, ordered task list.
//!
//! A task's position inside its column is its position among the tasks of
//! that column in [`Board::tasks`].

use crate::entity::StructuredEntity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignee {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub column_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Assignee>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
}

impl Task {
    pub fn new(id: impl Into<String>, column_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            column_id: column_id.into(),
            content: content.into(),
            description: None,
            tags: Vec::new(),
            assignee: None,
            comments: Vec::new(),
        }
    }
}

/// Partial update of a task. `None` leaves a field unchanged; the nested
/// options clear a field with `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub content: Option<String>,
    pub description: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub assignee: Option<Option<Assignee>>,
    pub comments: Option<Vec<Comment>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub columns: Vec<Column>,
    pub tasks: Vec<Task>,
}

impl Default for Board {
    fn default() -> Self {
        let column = |id: &str, title: &str| Column {
            id: id.to_string(),
            title: title.to_string(),
        };
        Self {
            columns: vec![
                column("todo", "To Do"),
                column("doing", "In Progress"),
                column("done", "Done"),
            ],
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoardMutation {
    AddColumn { id: String, title: String },
    RenameColumn { id: String, title: String },
    /// Removes the column together with its tasks.
    RemoveColumn { id: String },
    MoveColumn { id: String, index: usize },
    CreateTask(Task),
    UpdateTask { id: String, patch: TaskPatch },
    DeleteTask { id: String },
    /// Move a task into `column` at `index` among that column's tasks.
    /// Indices past the end append.
    MoveTask { task: String, column: String, index: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoardError {
    #[error("column `{0}` already exists")]
    DuplicateColumn(String),
    #[error("column `{0}` not found")]
    UnknownColumn(String),
    #[error("task `{0}` already exists")]
    DuplicateTask(String),
    #[error("task `{0}` not found")]
    UnknownTask(String),
}

impl Board {
    pub fn column(&self, id: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Tasks of a column in display order.
    pub fn tasks_in<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.iter().filter(move |t| t.column_id == column)
    }

    fn column_index(&self, id: &str) -> Result<usize, BoardError> {
        self.columns
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| BoardError::UnknownColumn(id.to_string()))
    }

    fn task_index(&self, id: &str) -> Result<usize, BoardError> {
        self.tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| BoardError::UnknownTask(id.to_string()))
    }

    fn move_task(&mut self, task: &str, column: &str, index: usize) -> Result<(), BoardError> {
        self.column_index(column)?;
        let from = self.task_index(task)?;

        let mut moved = self.tasks.remove(from);
        moved.column_id = column.to_string();

        let slots: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.column_id == column)
            .map(|(i, _)| i)
            .collect();

        let at = match slots.get(index) {
            Some(&i) => i,
            None => slots.last().map(|&i| i + 1).unwrap_or(self.tasks.len()),
        };
        self.tasks.insert(at, moved);
        Ok(())
    }
}

impl StructuredEntity for Board {
    type Mutation = BoardMutation;
    type Error = BoardError;

    const KIND: &'static str = "board";

    fn apply(&mut self, mutation: BoardMutation) -> Result<(), BoardError> {
        match mutation {
            BoardMutation::AddColumn { id, title } => {
                if self.column(&id).is_some() {
                    return Err(BoardError::DuplicateColumn(id));
                }
                self.columns.push(Column { id, title });
            }
            BoardMutation::RenameColumn { id, title } => {
                let i = self.column_index(&id)?;
                self.columns[i].title = title;
            }
            BoardMutation::RemoveColumn { id } => {
                let i = self.column_index(&id)?;
                self.columns.remove(i);
                self.tasks.retain(|t| t.column_id != id);
            }
            BoardMutation::MoveColumn { id, index } => {
                let from = self.column_index(&id)?;
                let column = self.columns.remove(from);
                let to = index.min(self.columns.len());
                self.columns.insert(to, column);
            }
            BoardMutation::CreateTask(task) => {
                self.column_index(&task.column_id)?;
                if self.task(&task.id).is_some() {
                    return Err(BoardError::DuplicateTask(task.id));
                }
                self.tasks.push(task);
            }
            BoardMutation::UpdateTask { id, patch } => {
                let i = self.task_index(&id)?;
                let task = &mut self.tasks[i];
                if let Some(content) = patch.content {
                    task.content = content;
                }
                if let Some(description) = patch.description {
                    task.description = description;
                }
                if let Some(tags) = patch.tags {
                    task.tags = tags;
                }
                if let Some(assignee) = patch.assignee {
                    task.assignee = assignee;
                }
                if let Some(comments) = patch.comments {
                    task.comments = comments;
                }
            }
            BoardMutation::DeleteTask { id } => {
                let i = self.task_index(&id)?;
                self.tasks.remove(i);
            }
            BoardMutation::MoveTask {
                task,
                column,
                index,
            } => self.move_task(&task, &column, index)?,
        }
        Ok(())
    }
}
