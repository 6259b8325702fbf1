use ahash::AHashMap;

use crate::constants::Label;

/// Two-way map between time-dependent base labels and their dense registration index.
///
/// Indices are handed out in insertion order and never reused, so the encoded
/// time-dependent labels stay stable for the lifetime of a time table.
#[derive(Debug, Clone, Default)]
pub(crate) struct LabelIndex {
    labels: Vec<Label>,
    index_of: AHashMap<Label, usize>,
}

impl LabelIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `label` and return its index; an already known label keeps its index.
    pub(crate) fn entry_or_insert(&mut self, label: Label) -> usize {
        if let Some(&idx) = self.index_of.get(&label) {
            return idx;
        }
        let idx = self.labels.len();
        self.labels.push(label);
        self.index_of.insert(label, idx);
        idx
    }

    pub(crate) fn index(&self, label: Label) -> Option<usize> {
        self.index_of.get(&label).copied()
    }

    pub(crate) fn label(&self, index: usize) -> Option<Label> {
        self.labels.get(index).copied()
    }

    pub(crate) fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub(crate) fn len(&self) -> usize {
        self.labels.len()
    }
}
