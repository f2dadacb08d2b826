//! Path resolution and tree operations on [`Storage`].

use crate::error::{ErrorKind, Result};
use crate::model::{MIME_DEFAULT, Node, ROOT_ID};
use crate::storage::{State, Storage};
use std::collections::HashSet;
use time::UtcDateTime;
use tracing::instrument;

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        exn::bail!(ErrorKind::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Live (non-trashed) child of `parent_id` called `name`.
fn find_child<'a>(state: &'a State, parent_id: &str, name: &str) -> Option<&'a Node> {
    state.nodes.values().find(|node| !node.trashed && node.parent_id == parent_id && node.name == name)
}

/// Check that `name` may be placed under `parent_id`. `moving` is the node
/// being renamed or moved, which never collides with itself.
pub(crate) fn check_new_child(state: &State, parent_id: &str, name: &str, moving: Option<&str>) -> Result<()> {
    validate_name(name)?;
    let parent = state.node(parent_id)?;
    if !parent.is_directory() {
        exn::bail!(ErrorKind::Resolution(format!("{} is not a directory", parent.name)));
    }
    if parent.trashed {
        exn::bail!(ErrorKind::InvalidOperation(format!("directory {parent_id} is in the trash")));
    }
    match find_child(state, parent_id, name) {
        Some(existing) if Some(existing.id.as_str()) != moving => exn::bail!(ErrorKind::AlreadyExists(name.to_string())),
        _ => Ok(()),
    }
}

impl Storage {
    /// Walk `segments` from the root.
    ///
    /// A missing final segment under an existing directory is created as an
    /// empty file. Empty segments are skipped, so `["", "a"]` is `["a"]`.
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, segments: &[&str]) -> Result<Node> {
        let mut state = self.lock().await;
        let segments: Vec<&str> = segments.iter().copied().filter(|segment| !segment.is_empty()).collect();
        let mut current = state.node(ROOT_ID)?.clone();
        for (index, segment) in segments.iter().enumerate() {
            if !current.is_directory() {
                exn::bail!(ErrorKind::Resolution(format!("{} is not a directory", current.name)));
            }
            match find_child(&state, &current.id, segment) {
                Some(child) => current = child.clone(),
                None if index + 1 == segments.len() => {
                    validate_name(segment)?;
                    let node = Node::file(*segment, MIME_DEFAULT, current.id.as_str());
                    tracing::debug!(node = %node.id, name = %segment, "created leaf");
                    return Ok(state.insert_node(node));
                },
                None => exn::bail!(ErrorKind::Resolution(format!("no such directory: {segment}"))),
            }
        }
        Ok(current)
    }

    /// [`resolve`](Self::resolve) a `/`-separated path.
    pub async fn resolve_path(&self, path: &str) -> Result<Node> {
        let segments: Vec<&str> = path.split('/').collect();
        self.resolve(&segments).await
    }

    pub async fn resolve_id(&self, id: &str) -> Result<Node> {
        let state = self.lock().await;
        match state.nodes.get(id) {
            Some(node) => Ok(node.clone()),
            None => exn::bail!(ErrorKind::Resolution(format!("no node with id {id}"))),
        }
    }

    /// Absolute path of a node, `/` for the root.
    pub async fn to_absolute_path(&self, id: &str) -> Result<String> {
        let state = self.lock().await;
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut current = state.node(id)?;
        while !current.is_root() {
            if !seen.insert(current.id.as_str()) {
                exn::bail!(ErrorKind::Resolution(format!("cycle in the parents of {id}")));
            }
            names.push(current.name.as_str());
            current = match state.nodes.get(&current.parent_id) {
                Some(parent) => parent,
                None => exn::bail!(ErrorKind::Resolution(format!("dangling parent {}", current.parent_id))),
            };
        }
        names.reverse();
        Ok(format!("/{}", names.join("/")))
    }

    /// Live children of a directory, sorted by name.
    pub async fn list_children(&self, id: &str) -> Result<Vec<Node>> {
        let state = self.lock().await;
        state.node(id)?;
        let mut children: Vec<Node> =
            state.nodes.values().filter(|node| !node.trashed && node.parent_id == id).cloned().collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    pub async fn create_directory(&self, parent_id: &str, name: &str) -> Result<Node> {
        let mut state = self.lock().await;
        check_new_child(&state, parent_id, name, None)?;
        Ok(state.insert_node(Node::directory(name, parent_id)))
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<Node> {
        let mut state = self.lock().await;
        let parent_id = guard_root(state.node(id)?, "renamed")?.parent_id.clone();
        check_new_child(&state, &parent_id, name, Some(id))?;
        let node = state.node_mut(id)?;
        node.name = name.to_string();
        node.modified = UtcDateTime::now();
        node.dirty = true;
        Ok(node.clone())
    }

    /// Re-parent a node. Moving a directory beneath itself is rejected.
    #[instrument(level = "debug", skip(self))]
    pub async fn move_to(&self, id: &str, parent_id: &str) -> Result<Node> {
        let mut state = self.lock().await;
        let name = guard_root(state.node(id)?, "moved")?.name.clone();
        check_new_child(&state, parent_id, &name, Some(id))?;
        let mut cursor = state.node(parent_id)?;
        loop {
            if cursor.id == id {
                exn::bail!(ErrorKind::InvalidOperation(format!("cannot move {id} beneath itself")));
            }
            match state.nodes.get(&cursor.parent_id) {
                Some(parent) if !cursor.is_root() => cursor = parent,
                _ => break,
            }
        }
        let node = state.node_mut(id)?;
        node.parent_id = parent_id.to_string();
        node.modified = UtcDateTime::now();
        node.dirty = true;
        Ok(node.clone())
    }

    /// Hide a node (and with it its subtree) from resolution.
    pub async fn trash(&self, id: &str) -> Result<Node> {
        let mut state = self.lock().await;
        guard_root(state.node(id)?, "trashed")?;
        let node = state.node_mut(id)?;
        node.trashed = true;
        node.deleted_at = Some(UtcDateTime::now());
        node.dirty = true;
        Ok(node.clone())
    }

    pub async fn restore(&self, id: &str) -> Result<Node> {
        let mut state = self.lock().await;
        let node = state.node(id)?;
        if !node.trashed {
            exn::bail!(ErrorKind::InvalidOperation(format!("{id} is not in the trash")));
        }
        let (parent_id, name) = (node.parent_id.clone(), node.name.clone());
        check_new_child(&state, &parent_id, &name, Some(id))?;
        let node = state.node_mut(id)?;
        node.trashed = false;
        node.deleted_at = None;
        node.dirty = true;
        Ok(node.clone())
    }

    /// Trashed nodes, most recently trashed first.
    pub async fn list_trash(&self) -> Vec<Node> {
        let state = self.lock().await;
        let mut trashed: Vec<Node> = state.nodes.values().filter(|node| node.trashed).cloned().collect();
        trashed.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        trashed
    }

    /// Free a node and its whole subtree, children first.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let order = {
            let state = self.lock().await;
            guard_root(state.node(id)?, "deleted")?;
            let mut order = Vec::new();
            let mut stack = vec![id.to_string()];
            while let Some(next) = stack.pop() {
                stack.extend(state.nodes.values().filter(|node| node.parent_id == next).map(|node| node.id.clone()));
                order.push(next);
            }
            order
        };
        let count = order.len();
        for node_id in order.into_iter().rev() {
            self.free_node(&node_id).await?;
        }
        tracing::debug!(nodes = count, "subtree deleted");
        Ok(())
    }
}

fn guard_root<'a>(node: &'a Node, action: &str) -> Result<&'a Node> {
    if node.is_root() {
        exn::bail!(ErrorKind::InvalidOperation(format!("the root cannot be {action}")));
    }
    Ok(node)
}
