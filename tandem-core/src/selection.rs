use serde::{Deserialize, Serialize};

use crate::operation::Operation;

/// A cursor or selection expressed as character offsets.
///
/// `anchor == head` is a plain caret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn caret(pos: usize) -> Self {
        Self::new(pos, pos)
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }

    /// Shift both ends through an operation applied to the underlying text.
    pub fn transform(&self, op: &Operation) -> Self {
        Self {
            anchor: op.transform_index(self.anchor),
            head: op.transform_index(self.head),
        }
    }

    /// Clamp both ends to a document of `len` characters.
    pub fn clamp(&self, len: usize) -> Self {
        Self {
            anchor: self.anchor.min(len),
            head: self.head.min(len),
        }
    }
}
