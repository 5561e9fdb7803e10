//! The evaluated document: an ordered list of cells.
//!
//! Editing and persistence belong to the host; a cell exposes only its
//! text, and a document only its JSON snapshot.

use crate::error::Error;
use crate::lock;
use quire_output::Surface;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Persisted form of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

fn default_kind() -> String {
    "markdown".to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DocumentSnapshot {
    cells: Vec<CellSnapshot>,
}

/// A unit of evaluation: source text plus the renderer type that evaluates it.
#[derive(Clone)]
pub struct Cell {
    inner: Arc<CellInner>,
}

struct CellInner {
    id: String,
    kind: Mutex<String>,
    text: Mutex<String>,
    output: Surface,
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .finish()
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Cell {}

impl Cell {
    fn new(id: String, kind: String, text: String) -> Self {
        let output = Surface::root("div");
        output.set_attr("data-output-for", id.clone());
        Self {
            inner: Arc::new(CellInner {
                id,
                kind: Mutex::new(kind),
                text: Mutex::new(text),
                output,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The renderer type used to evaluate this cell.
    pub fn kind(&self) -> String {
        lock(&self.inner.kind).clone()
    }

    pub fn set_kind(&self, kind: impl Into<String>) {
        *lock(&self.inner.kind) = kind.into();
    }

    pub fn text(&self) -> String {
        lock(&self.inner.text).clone()
    }

    pub fn set_text(&self, text: impl Into<String>) {
        *lock(&self.inner.text) = text.into();
    }

    /// Container for every output surface produced for this cell.
    pub fn output(&self) -> &Surface {
        &self.inner.output
    }

    pub fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            id: self.id().to_string(),
            kind: self.kind(),
            text: self.text(),
        }
    }
}

#[derive(Clone, Default)]
pub struct Document {
    inner: Arc<Mutex<DocumentState>>,
}

#[derive(Default)]
struct DocumentState {
    cells: Vec<Cell>,
    next_id: u64,
}

impl DocumentState {
    fn position(&self, id: &str) -> Option<usize> {
        self.cells.iter().position(|cell| cell.id() == id)
    }

    fn fresh_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("cell-{}", self.next_id);
            if self.position(&id).is_none() {
                return id;
            }
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(lock(&self.inner).cells.iter()).finish()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &str) -> Result<Self, Error> {
        let snapshot: DocumentSnapshot = serde_json::from_str(snapshot)?;
        let mut seen = HashSet::new();
        let mut cells = Vec::with_capacity(snapshot.cells.len());
        for cell in snapshot.cells {
            if !seen.insert(cell.id.clone()) {
                return Err(Error::DuplicateCell(cell.id));
            }
            cells.push(Cell::new(cell.id, cell.kind, cell.text));
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(DocumentState { cells, next_id: 0 })),
        })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let snapshot = tokio::fs::read_to_string(path).await?;
        Self::from_snapshot(&snapshot)
    }

    pub fn to_snapshot(&self) -> Result<String, Error> {
        let snapshot = DocumentSnapshot {
            cells: self.cells().iter().map(Cell::snapshot).collect(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    pub fn cells(&self) -> Vec<Cell> {
        lock(&self.inner).cells.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).cells.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).cells.is_empty()
    }

    pub fn cell(&self, id: &str) -> Option<Cell> {
        let state = lock(&self.inner);
        state.position(id).map(|index| state.cells[index].clone())
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        lock(&self.inner).position(id)
    }

    /// Insert a new cell at `index` (clamped to the end) with a fresh id.
    pub fn insert_cell(&self, index: usize, kind: impl Into<String>, text: impl Into<String>) -> Cell {
        let mut state = lock(&self.inner);
        let id = state.fresh_id();
        let cell = Cell::new(id, kind.into(), text.into());
        let index = index.min(state.cells.len());
        state.cells.insert(index, cell.clone());
        cell
    }

    /// Insert a new cell next to the cell `id`.
    pub fn insert_next_to(
        &self,
        id: &str,
        after: bool,
        kind: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Cell, Error> {
        let index = self
            .position(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        Ok(self.insert_cell(if after { index + 1 } else { index }, kind, text))
    }

    pub fn remove_cell(&self, id: &str) -> Result<Cell, Error> {
        let mut state = lock(&self.inner);
        let index = state
            .position(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        Ok(state.cells.remove(index))
    }

    /// Swap the cell with its neighbour; false when already at that end.
    pub fn move_cell(&self, id: &str, down: bool) -> Result<bool, Error> {
        let mut state = lock(&self.inner);
        let index = state
            .position(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))?;
        let other = match (down, index) {
            (false, 0) => return Ok(false),
            (false, index) => index - 1,
            (true, index) if index + 1 >= state.cells.len() => return Ok(false),
            (true, index) => index + 1,
        };
        state.cells.swap(index, other);
        Ok(true)
    }

    /// The neighbouring cell, following (`forward`) or preceding `id`.
    pub fn adjacent(&self, id: &str, forward: bool) -> Option<Cell> {
        let state = lock(&self.inner);
        let index = state.position(id)?;
        let index = if forward {
            index.checked_add(1)?
        } else {
            index.checked_sub(1)?
        };
        state.cells.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Document {
        Document::from_snapshot(
            r#"{"cells": [
                {"id": "intro", "kind": "markdown", "text": "hello"},
                {"id": "calc", "kind": "script", "text": "print 1"},
                {"id": "bare"}
            ]}"#,
        )
        .unwrap()
    }

    fn ids(document: &Document) -> Vec<String> {
        document.cells().iter().map(|cell| cell.id().to_string()).collect()
    }

    #[test]
    fn snapshot_fills_defaults_and_survives_edits() {
        let document = sample();
        let bare = document.cell("bare").unwrap();
        assert_eq!(bare.kind(), "markdown");
        assert_eq!(bare.text(), "");

        document.cell("calc").unwrap().set_text("print 2");
        let restored = Document::from_snapshot(&document.to_snapshot().unwrap()).unwrap();
        assert_eq!(restored.cell("calc").unwrap().text(), "print 2");
        assert_eq!(ids(&restored), ids(&document));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = Document::from_snapshot(r#"{"cells": [{"id": "a"}, {"id": "a"}]}"#).unwrap_err();
        assert!(matches!(err, Error::DuplicateCell(id) if id == "a"));
        assert!(matches!(
            Document::from_snapshot("not json"),
            Err(Error::Snapshot(_))
        ));
    }

    #[test]
    fn structural_edits() {
        let document = sample();
        let added = document.insert_next_to("intro", true, "latex", "x").unwrap();
        assert_eq!(added.id(), "cell-1");
        assert_eq!(ids(&document), ["intro", "cell-1", "calc", "bare"]);

        assert!(document.move_cell("intro", true).unwrap());
        assert!(!document.move_cell("cell-1", false).unwrap());
        assert!(!document.move_cell("bare", true).unwrap());
        assert_eq!(ids(&document), ["cell-1", "intro", "calc", "bare"]);

        assert_eq!(document.adjacent("intro", true).map(|c| c.id().to_string()), Some("calc".into()));
        assert_eq!(document.adjacent("cell-1", false), None);

        document.remove_cell("calc").unwrap();
        assert_eq!(document.position("bare"), Some(2));
        assert!(matches!(document.remove_cell("calc"), Err(Error::CellNotFound(_))));
    }

    #[test]
    fn fresh_ids_skip_existing() {
        let document = Document::from_snapshot(r#"{"cells": [{"id": "cell-1"}]}"#).unwrap();
        assert_eq!(document.insert_cell(usize::MAX, "plain", "").id(), "cell-2");
        assert_eq!(document.len(), 2);
    }
}
