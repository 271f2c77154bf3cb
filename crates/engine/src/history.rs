use std::collections::VecDeque;

use spacesync_core::model::{Card, CardPatch, Connection};

/// One user gesture, as much of it as is needed to reverse it.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    /// Only the fields that changed, before and after.
    Diff {
        before: Vec<CardPatch>,
        after: Vec<CardPatch>,
    },
    /// Full card state around a gesture that has settled.
    Snapshot { before: Vec<Card>, after: Vec<Card> },
    Created { cards: Vec<Card> },
    Removed {
        cards: Vec<Card>,
        connections: Vec<Connection>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AddOptions {
    pub use_snapshot: bool,
}

impl HistoryEntry {
    /// Builds the entry for cards that went from `before` to `after` (matched
    /// by id). Returns `None` when nothing changed.
    pub fn for_changes(before: &[Card], after: &[Card], options: AddOptions) -> Option<Self> {
        let pairs: Vec<(&Card, &Card)> = before
            .iter()
            .filter_map(|old| after.iter().find(|new| new.id == old.id).map(|new| (old, new)))
            .filter(|(old, new)| old != new)
            .collect();
        if pairs.is_empty() {
            return None;
        }

        if options.use_snapshot {
            return Some(Self::Snapshot {
                before: pairs.iter().map(|(old, _)| (*old).clone()).collect(),
                after: pairs.iter().map(|(_, new)| (*new).clone()).collect(),
            });
        }

        let mut before_patches = Vec::with_capacity(pairs.len());
        let mut after_patches = Vec::with_capacity(pairs.len());
        for (old, new) in pairs {
            if let Some(forward) = old.diff(new) {
                before_patches.push(old.project(&forward));
                after_patches.push(forward);
            }
        }
        Some(Self::Diff {
            before: before_patches,
            after: after_patches,
        })
    }
}

/// Depth-bounded undo and redo stacks. While paused, entries are dropped so
/// that a continuous gesture can be recorded once when it ends.
pub struct History {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
    max_depth: usize,
    paused: bool,
}

impl History {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_depth,
            paused: false,
        }
    }

    /// Records a new gesture and clears redo. Returns false while paused.
    pub fn add(&mut self, entry: HistoryEntry) -> bool {
        if self.paused {
            return false;
        }
        self.push_undo(entry);
        self.clear_redo();
        true
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pushes without touching redo, as redo itself does.
    pub fn push_undo(&mut self, entry: HistoryEntry) {
        self.undo_stack.push_back(entry);
        // Enforce depth limit by dropping oldest entry
        if self.undo_stack.len() > self.max_depth {
            self.undo_stack.pop_front();
        }
    }

    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.undo_stack.pop_back()
    }

    pub fn push_redo(&mut self, entry: HistoryEntry) {
        self.redo_stack.push_back(entry);
        if self.redo_stack.len() > self.max_depth {
            self.redo_stack.pop_front();
        }
    }

    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        self.redo_stack.pop_back()
    }

    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.paused = false;
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.undo_stack.back()
    }
}
