//! Hierarchical file tree of a project.
//!
//! Siblings are always kept sorted: folders first, then by title.

use crate::entity::StructuredEntity;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Document,
    Kanban,
    Calendar,
}

impl NodeKind {
    /// Kind of a row given its folder flag and optional type column.
    pub fn from_row(is_folder: bool, kind: Option<&str>) -> Self {
        if is_folder {
            return NodeKind::Folder;
        }
        match kind {
            Some("kanban") => NodeKind::Kanban,
            Some("calendar") => NodeKind::Calendar,
            Some("folder") => NodeKind::Folder,
            _ => NodeKind::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: String,
    pub title: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub children: Vec<FileNode>,
}

impl FileNode {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            kind,
            icon: None,
            updated_at: None,
            children: Vec::new(),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

/// Flat row as stored in the `documents` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRow {
    pub id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub is_folder: bool,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TreeMutation {
    Create {
        id: String,
        title: String,
        kind: NodeKind,
        /// `None` creates at the root.
        parent: Option<String>,
    },
    Rename { id: String, title: String },
    Move { id: String, parent: Option<String> },
    /// Deletes the node and its whole subtree.
    Delete { id: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("node `{0}` not found")]
    UnknownNode(String),
    #[error("node `{0}` already exists")]
    DuplicateNode(String),
    #[error("node `{0}` is not a folder")]
    NotAFolder(String),
    #[error("moving `{node}` under `{parent}` would create a cycle")]
    Cycle { node: String, parent: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileTree {
    pub roots: Vec<FileNode>,
}

impl FileTree {
    /// Build a tree from flat rows.
    ///
    /// The row whose id equals `project_id` is the project itself and is
    /// skipped. Rows without a parent, parented to the project, or whose
    /// parent is missing land at the root.
    pub fn from_rows(project_id: &str, rows: &[FileRow]) -> Self {
        let rows: Vec<&FileRow> = rows.iter().filter(|r| r.id != project_id).collect();
        let known: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();

        let mut children: HashMap<Option<&str>, Vec<&FileRow>> = HashMap::new();
        for &row in &rows {
            let parent = match row.parent_id.as_deref() {
                Some(p) if p != project_id && known.contains(p) && p != row.id => Some(p),
                _ => None,
            };
            children.entry(parent).or_default().push(row);
        }

        fn build<'a>(
            parent: Option<&'a str>,
            children: &HashMap<Option<&'a str>, Vec<&'a FileRow>>,
            visiting: &mut HashSet<String>,
        ) -> Vec<FileNode> {
            let mut nodes = Vec::new();
            let siblings = children.get(&parent).map(Vec::as_slice).unwrap_or_default();
            for &row in siblings {
                if !visiting.insert(row.id.clone()) {
                    continue;
                }
                let mut node = FileNode::new(
                    row.id.clone(),
                    row.title.clone(),
                    NodeKind::from_row(row.is_folder, row.kind.as_deref()),
                );
                node.icon = row.icon.clone();
                node.updated_at = row.updated_at.clone();
                node.children = build(Some(row.id.as_str()), children, visiting);
                nodes.push(node);
            }
            sort_siblings(&mut nodes);
            nodes
        }

        let mut visiting = HashSet::new();
        Self {
            roots: build(None, &children, &mut visiting),
        }
    }

    pub fn find(&self, id: &str) -> Option<&FileNode> {
        fn walk<'a>(nodes: &'a [FileNode], id: &str) -> Option<&'a FileNode> {
            nodes
                .iter()
                .find_map(|n| if n.id == id { Some(n) } else { walk(&n.children, id) })
        }
        walk(&self.roots, id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut FileNode> {
        fn walk<'a>(nodes: &'a mut [FileNode], id: &str) -> Option<&'a mut FileNode> {
            for node in nodes.iter_mut() {
                if node.id == id {
                    return Some(node);
                }
                if let Some(found) = walk(&mut node.children, id) {
                    return Some(found);
                }
            }
            None
        }
        walk(&mut self.roots, id)
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        fn count(nodes: &[FileNode]) -> usize {
            nodes.iter().map(|n| 1 + count(&n.children)).sum()
        }
        count(&self.roots)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Detach a node (with its subtree) from wherever it sits.
    fn detach(&mut self, id: &str) -> Option<FileNode> {
        fn take(nodes: &mut Vec<FileNode>, id: &str) -> Option<FileNode> {
            if let Some(i) = nodes.iter().position(|n| n.id == id) {
                return Some(nodes.remove(i));
            }
            nodes.iter_mut().find_map(|n| take(&mut n.children, id))
        }
        take(&mut self.roots, id)
    }

    fn siblings_mut(&mut self, parent: Option<&str>) -> Result<&mut Vec<FileNode>, TreeError> {
        match parent {
            None => Ok(&mut self.roots),
            Some(parent) => {
                let node = self
                    .find_mut(parent)
                    .ok_or_else(|| TreeError::UnknownNode(parent.to_string()))?;
                if !node.is_folder() {
                    return Err(TreeError::NotAFolder(parent.to_string()));
                }
                Ok(&mut node.children)
            }
        }
    }

    fn check_parent(&self, parent: Option<&str>) -> Result<(), TreeError> {
        if let Some(parent) = parent {
            let node = self
                .find(parent)
                .ok_or_else(|| TreeError::UnknownNode(parent.to_string()))?;
            if !node.is_folder() {
                return Err(TreeError::NotAFolder(parent.to_string()));
            }
        }
        Ok(())
    }

    fn resort(nodes: &mut [FileNode]) {
        sort_siblings(nodes);
        for node in nodes.iter_mut() {
            Self::resort(&mut node.children);
        }
    }
}

fn sort_siblings(nodes: &mut [FileNode]) {
    nodes.sort_by(|a, b| match (a.is_folder(), b.is_folder()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a
            .title
            .to_lowercase()
            .cmp(&b.title.to_lowercase())
            .then_with(|| a.title.cmp(&b.title)),
    });
}

impl StructuredEntity for FileTree {
    type Mutation = TreeMutation;
    type Error = TreeError;

    const KIND: &'static str = "file_tree";

    fn apply(&mut self, mutation: TreeMutation) -> Result<(), TreeError> {
        match mutation {
            TreeMutation::Create {
                id,
                title,
                kind,
                parent,
            } => {
                if self.find(&id).is_some() {
                    return Err(TreeError::DuplicateNode(id));
                }
                let siblings = self.siblings_mut(parent.as_deref())?;
                siblings.push(FileNode::new(id, title, kind));
                sort_siblings(siblings);
            }
            TreeMutation::Rename { id, title } => {
                let node = self
                    .find_mut(&id)
                    .ok_or_else(|| TreeError::UnknownNode(id.clone()))?;
                node.title = title;
                Self::resort(&mut self.roots);
            }
            TreeMutation::Move { id, parent } => {
                let node = self.find(&id).ok_or_else(|| TreeError::UnknownNode(id.clone()))?;
                if let Some(parent) = parent.as_deref() {
                    let inside_subtree = parent == id || {
                        let subtree = FileTree {
                            roots: node.children.clone(),
                        };
                        subtree.find(parent).is_some()
                    };
                    if inside_subtree {
                        return Err(TreeError::Cycle {
                            node: id,
                            parent: parent.to_string(),
                        });
                    }
                }
                self.check_parent(parent.as_deref())?;

                let node = self.detach(&id).ok_or_else(|| TreeError::UnknownNode(id.clone()))?;
                let siblings = self.siblings_mut(parent.as_deref())?;
                siblings.push(node);
                sort_siblings(siblings);
            }
            TreeMutation::Delete { id } => {
                self.detach(&id).ok_or(TreeError::UnknownNode(id))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, title: &str, parent: Option<&str>, is_folder: bool) -> FileRow {
        FileRow {
            id: id.to_string(),
            title: title.to_string(),
            parent_id: parent.map(str::to_string),
            is_folder,
            icon: None,
            kind: None,
            updated_at: None,
        }
    }

    fn titles(nodes: &[FileNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.title.as_str()).collect()
    }

    fn sample() -> FileTree {
        FileTree::from_rows(
            "proj",
            &[
                row("proj", "Project", None, true),
                row("f1", "Specs", Some("proj"), true),
                row("d1", "beta", Some("f1"), false),
                row("d2", "Alpha", Some("f1"), false),
                row("d3", "Notes", None, false),
            ],
        )
    }

    #[test]
    fn test_from_rows_builds_sorted_tree() {
        let tree = sample();
        assert_eq!(titles(&tree.roots), ["Specs", "Notes"]);
        assert_eq!(titles(&tree.roots[0].children), ["Alpha", "beta"]);
        assert!(tree.find("proj").is_none());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_orphans_go_to_root() {
        let tree = FileTree::from_rows("proj", &[row("x", "Lost", Some("missing"), false)]);
        assert_eq!(titles(&tree.roots), ["Lost"]);
    }

    #[test]
    fn test_row_type_maps_to_kind() {
        let mut kanban = row("k", "Board", None, false);
        kanban.kind = Some("kanban".into());
        let tree = FileTree::from_rows("proj", &[kanban]);
        assert_eq!(tree.roots[0].kind, NodeKind::Kanban);
    }

    #[test]
    fn test_create_under_folder() {
        let mut tree = sample();
        tree.apply(TreeMutation::Create {
            id: "d4".into(),
            title: "Zeta".into(),
            kind: NodeKind::Document,
            parent: Some("f1".into()),
        })
        .unwrap();
        assert_eq!(titles(&tree.find("f1").unwrap().children), ["Alpha", "beta", "Zeta"]);
    }

    #[test]
    fn test_create_under_document_is_rejected() {
        let mut tree = sample();
        assert_eq!(
            tree.apply(TreeMutation::Create {
                id: "d4".into(),
                title: "x".into(),
                kind: NodeKind::Document,
                parent: Some("d3".into()),
            }),
            Err(TreeError::NotAFolder("d3".into()))
        );
    }

    #[test]
    fn test_move_into_own_subtree_is_a_cycle() {
        let mut tree = sample();
        tree.apply(TreeMutation::Create {
            id: "f2".into(),
            title: "Inner".into(),
            kind: NodeKind::Folder,
            parent: Some("f1".into()),
        })
        .unwrap();
        let before = tree.clone();

        assert!(matches!(
            tree.apply(TreeMutation::Move {
                id: "f1".into(),
                parent: Some("f2".into()),
            }),
            Err(TreeError::Cycle { .. })
        ));
        assert!(matches!(
            tree.apply(TreeMutation::Move {
                id: "f1".into(),
                parent: Some("f1".into()),
            }),
            Err(TreeError::Cycle { .. })
        ));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_move_to_root_and_back() {
        let mut tree = sample();
        tree.apply(TreeMutation::Move {
            id: "d1".into(),
            parent: None,
        })
        .unwrap();
        assert_eq!(titles(&tree.roots), ["Specs", "beta", "Notes"]);

        tree.apply(TreeMutation::Move {
            id: "d1".into(),
            parent: Some("f1".into()),
        })
        .unwrap();
        assert_eq!(tree, sample());
    }

    #[test]
    fn test_delete_removes_subtree() {
        let mut tree = sample();
        tree.apply(TreeMutation::Delete { id: "f1".into() }).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.find("d1").is_none());
        assert_eq!(
            tree.apply(TreeMutation::Delete { id: "f1".into() }),
            Err(TreeError::UnknownNode("f1".into()))
        );
    }

    #[test]
    fn test_rename_resorts() {
        let mut tree = sample();
        tree.apply(TreeMutation::Rename {
            id: "d2".into(),
            title: "gamma".into(),
        })
        .unwrap();
        assert_eq!(titles(&tree.find("f1").unwrap().children), ["beta", "gamma"]);
    }
}
