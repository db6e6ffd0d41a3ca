//! Duplicate detection on the caller's search columns.

use crate::schema::{Row, RowLayout};
use crate::value::Value;
use std::collections::HashSet;

/// Joins the key parts of a composite duplicate key.
pub const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Insert,
    Duplicate,
}

/// What the resolver compares incoming rows against.
#[derive(Debug, Clone)]
pub enum ExistingRows {
    /// Key-column values only, positional against the search columns.
    Keys(Vec<Vec<Value>>),
    /// Full stored rows, positional against the user columns.
    Snapshot(Vec<Vec<Value>>),
}

/// Build the composite key text from key-part values in order.
pub fn key_of<'a>(parts: impl IntoIterator<Item = &'a Value>) -> String {
    let mut key = String::new();
    for (idx, part) in parts.into_iter().enumerate() {
        if idx > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&part.key_text());
    }
    key
}

pub struct DuplicateResolver {
    positions: Vec<usize>,
    seen: HashSet<String>,
}

impl DuplicateResolver {
    pub fn new(layout: &RowLayout, existing: ExistingRows) -> Self {
        let positions = layout.search_positions().to_vec();

        let seen = match existing {
            ExistingRows::Keys(keys) => keys.iter().map(|parts| key_of(parts)).collect(),
            ExistingRows::Snapshot(rows) => rows
                .iter()
                .map(|row| key_of(positions.iter().filter_map(|&idx| row.get(idx))))
                .collect(),
        };

        Self { positions, seen }
    }

    /// A resolver that classifies every row as an insert.
    pub fn disabled() -> Self {
        Self {
            positions: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn is_active(&self) -> bool {
        !self.positions.is_empty()
    }

    pub fn known_keys(&self) -> usize {
        self.seen.len()
    }

    fn key_for(&self, row: &Row) -> String {
        key_of(self.positions.iter().map(|&idx| row.value(idx)))
    }

    /// Classify one row. Accepted keys are remembered for the rest of the job.
    pub fn classify(&mut self, row: &Row) -> Classification {
        if !self.is_active() {
            return Classification::Insert;
        }

        if self.seen.insert(self.key_for(row)) {
            Classification::Insert
        } else {
            Classification::Duplicate
        }
    }
}
