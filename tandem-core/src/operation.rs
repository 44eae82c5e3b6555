//! Edit operations over plain text.
//!
//! An [`Operation`] walks the source document left to right with three
//! primitives:
//!
//! ```text
//! source:  h e l l o
//!          ├─────┤ ├─┤
//!          Retain(3) Delete(2)   Insert("p!")
//! result:  h e l p !
//! ```
//!
//! Lengths are counted in `char`s, never bytes, so the same operation means
//! the same thing on every replica regardless of encoding.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::OtError;

/// Revision number of a document state. Revision 0 is the initial state.
pub type Revision = u64;

/// Identifier of the client that originated an operation.
///
/// The ordering of client ids is the tie-break used when two concurrent
/// operations insert at the same position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A single edit primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// Keep the next `n` characters.
    Retain(usize),
    /// Insert a string at the current position.
    Insert(String),
    /// Remove the next `n` characters.
    Delete(usize),
}

impl Component {
    pub fn is_insert(&self) -> bool {
        matches!(self, Component::Insert(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n == 0,
            Component::Insert(s) => s.is_empty(),
        }
    }
}

/// An ordered sequence of edit primitives plus its origin metadata.
///
/// Components are always kept in canonical form: no zero-length components,
/// adjacent components of the same kind are merged, and an insert that would
/// follow a delete is placed before it. Two operations with the same effect
/// therefore compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireOperation", into = "WireOperation")]
pub struct Operation {
    /// Client that composed this operation.
    pub client_id: ClientId,
    /// Revision of the document state the operation was composed against.
    pub revision: Revision,
    components: Vec<Component>,
    base_len: usize,
    target_len: usize,
}

impl Operation {
    /// Create an empty operation (identity over an empty document).
    pub fn new(client_id: ClientId, revision: Revision) -> Self {
        Self {
            client_id,
            revision,
            components: Vec::new(),
            base_len: 0,
            target_len: 0,
        }
    }

    /// Insert `text` at character offset `pos` of a document of `doc_len` characters.
    pub fn insert_at(
        client_id: ClientId,
        revision: Revision,
        doc_len: usize,
        pos: usize,
        text: &str,
    ) -> Self {
        let pos = pos.min(doc_len);
        Self::new(client_id, revision)
            .retain(pos)
            .insert(text)
            .retain(doc_len - pos)
    }

    /// Delete the character range `start..end` of a document of `doc_len` characters.
    pub fn delete_range(
        client_id: ClientId,
        revision: Revision,
        doc_len: usize,
        start: usize,
        end: usize,
    ) -> Self {
        let end = end.min(doc_len);
        let start = start.min(end);
        Self::new(client_id, revision)
            .retain(start)
            .delete(end - start)
            .retain(doc_len - end)
    }

    pub fn retain(mut self, n: usize) -> Self {
        self.push_retain(n);
        self
    }

    pub fn insert(mut self, text: &str) -> Self {
        self.push_insert(text);
        self
    }

    pub fn delete(mut self, n: usize) -> Self {
        self.push_delete(n);
        self
    }

    pub fn push_retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
    }

    pub fn push_insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.target_len += text.chars().count();
        if let Some(Component::Insert(last)) = self.components.last_mut() {
            last.push_str(text);
            return;
        }
        // Keep inserts ahead of deletes so equivalent operations are equal.
        let len = self.components.len();
        if let Some(Component::Delete(_)) = self.components.last() {
            if len >= 2 {
                if let Component::Insert(prev) = &mut self.components[len - 2] {
                    prev.push_str(text);
                    return;
                }
            }
            self.components.insert(len - 1, Component::Insert(text.to_string()));
            return;
        }
        self.components.push(Component::Insert(text.to_string()));
    }

    pub fn push_delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.base_len += n;
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Delete(n));
        }
    }

    /// Return a copy tagged with a different base revision.
    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = revision;
        self
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Length of the document this operation applies to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the document this operation produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True when applying the operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Check that the operation consumes exactly `source_len` characters.
    pub fn validate(&self, source_len: usize) -> Result<(), OtError> {
        if self.base_len != source_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len,
                actual: source_len,
            });
        }
        Ok(())
    }

    /// Apply the operation to `text`.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        self.validate(text.chars().count())?;

        let mut chars = text.chars();
        let mut out = String::with_capacity(text.len());
        for component in &self.components {
            match component {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Insert(s) => out.push_str(s),
                Component::Delete(n) => chars.by_ref().take(*n).for_each(drop),
            }
        }
        Ok(out)
    }

    /// Build the operation that undoes `self` once applied to `self.apply(original)`.
    pub fn invert(&self, original: &str) -> Result<Operation, OtError> {
        self.validate(original.chars().count())?;

        let mut inverse = Operation::new(self.client_id, self.revision);
        let mut chars = original.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    inverse.push_retain(*n);
                    chars.by_ref().take(*n).for_each(drop);
                }
                Component::Insert(s) => inverse.push_delete(s.chars().count()),
                Component::Delete(n) => {
                    let removed: String = chars.by_ref().take(*n).collect();
                    inverse.push_insert(&removed);
                }
            }
        }
        Ok(inverse)
    }

    /// Merge `self` followed by `next` into a single operation.
    ///
    /// The result carries the metadata of `self`.
    pub fn compose(&self, next: &Operation) -> Result<Operation, OtError> {
        if self.target_len != next.base_len {
            return Err(OtError::ComposeMismatch {
                first: self.target_len,
                second: next.base_len,
            });
        }

        let mismatch = || OtError::ComposeMismatch {
            first: self.target_len,
            second: next.base_len,
        };

        let mut composed = Operation::new(self.client_id, self.revision);
        let mut ops1 = self.components.iter().cloned();
        let mut ops2 = next.components.iter().cloned();
        let mut a = ops1.next();
        let mut b = ops2.next();

        loop {
            match (a, b) {
                (None, None) => break,
                (Some(Component::Delete(n)), rest) => {
                    composed.push_delete(n);
                    a = ops1.next();
                    b = rest;
                }
                (rest, Some(Component::Insert(s))) => {
                    composed.push_insert(&s);
                    a = rest;
                    b = ops2.next();
                }
                (None, _) | (_, None) => return Err(mismatch()),
                (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                    composed.push_retain(x.min(y));
                    (a, b) = match x.cmp(&y) {
                        Ordering::Less => (ops1.next(), Some(Component::Retain(y - x))),
                        Ordering::Equal => (ops1.next(), ops2.next()),
                        Ordering::Greater => (Some(Component::Retain(x - y)), ops2.next()),
                    };
                }
                (Some(Component::Insert(s)), Some(Component::Delete(y))) => {
                    let len = s.chars().count();
                    (a, b) = match len.cmp(&y) {
                        Ordering::Less => (ops1.next(), Some(Component::Delete(y - len))),
                        Ordering::Equal => (ops1.next(), ops2.next()),
                        Ordering::Greater => {
                            let (_, tail) = split_chars(&s, y);
                            (Some(Component::Insert(tail.to_string())), ops2.next())
                        }
                    };
                }
                (Some(Component::Insert(s)), Some(Component::Retain(y))) => {
                    let len = s.chars().count();
                    (a, b) = match len.cmp(&y) {
                        Ordering::Less => {
                            composed.push_insert(&s);
                            (ops1.next(), Some(Component::Retain(y - len)))
                        }
                        Ordering::Equal => {
                            composed.push_insert(&s);
                            (ops1.next(), ops2.next())
                        }
                        Ordering::Greater => {
                            let (head, tail) = split_chars(&s, y);
                            composed.push_insert(head);
                            (Some(Component::Insert(tail.to_string())), ops2.next())
                        }
                    };
                }
                (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                    composed.push_delete(x.min(y));
                    (a, b) = match x.cmp(&y) {
                        Ordering::Less => (ops1.next(), Some(Component::Delete(y - x))),
                        Ordering::Equal => (ops1.next(), ops2.next()),
                        Ordering::Greater => (Some(Component::Retain(x - y)), ops2.next()),
                    };
                }
            }
        }

        Ok(composed)
    }

    /// Map a character offset in the source document to the result document.
    ///
    /// A position exactly at an insertion point moves past the inserted text.
    pub fn transform_index(&self, index: usize) -> usize {
        let mut remaining = index as isize;
        let mut moved = index as isize;
        for component in &self.components {
            match component {
                Component::Retain(n) => remaining -= *n as isize,
                Component::Insert(s) => moved += s.chars().count() as isize,
                Component::Delete(n) => {
                    moved -= remaining.min(*n as isize);
                    remaining -= *n as isize;
                }
            }
            if remaining < 0 {
                break;
            }
        }
        moved.max(0) as usize
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}[", self.client_id, self.revision)?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match component {
                Component::Retain(n) => write!(f, "retain {n}")?,
                Component::Insert(s) => write!(f, "insert {s:?}")?,
                Component::Delete(n) => write!(f, "delete {n}")?,
            }
        }
        f.write_str("]")
    }
}

/// Serialized shape of an [`Operation`]; lengths are recomputed on decode.
#[derive(Serialize, Deserialize)]
struct WireOperation {
    client_id: ClientId,
    revision: Revision,
    components: Vec<Component>,
}

impl From<Operation> for WireOperation {
    fn from(op: Operation) -> Self {
        Self {
            client_id: op.client_id,
            revision: op.revision,
            components: op.components,
        }
    }
}

impl TryFrom<WireOperation> for Operation {
    type Error = OtError;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        let mut op = Operation::new(wire.client_id, wire.revision);
        for component in wire.components {
            if component.is_empty() {
                return Err(OtError::EmptyComponent);
            }
            match component {
                Component::Retain(n) => op.push_retain(n),
                Component::Insert(s) => op.push_insert(&s),
                Component::Delete(n) => op.push_delete(n),
            }
        }
        Ok(op)
    }
}

/// Split `s` after its first `n` characters.
pub(crate) fn split_chars(s: &str, n: usize) -> (&str, &str) {
    let at = s.char_indices().nth(n).map_or(s.len(), |(i, _)| i);
    s.split_at(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ClientId = ClientId(1);

    #[test]
    fn test_builder_merges_adjacent_components() {
        let op = Operation::new(A, 0).retain(2).retain(3).insert("ab").insert("c").delete(1).delete(2);
        assert_eq!(
            op.components(),
            &[
                Component::Retain(5),
                Component::Insert("abc".into()),
                Component::Delete(3),
            ]
        );
        assert_eq!(op.base_len(), 8);
        assert_eq!(op.target_len(), 8);
    }

    #[test]
    fn test_insert_after_delete_is_reordered() {
        let a = Operation::new(A, 0).retain(1).delete(2).insert("x");
        let b = Operation::new(A, 0).retain(1).insert("x").delete(2);
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_length_components_are_dropped() {
        let op = Operation::new(A, 0).retain(0).insert("").delete(0);
        assert!(op.components().is_empty());
        assert!(op.is_noop());
    }

    #[test]
    fn test_apply_basic() {
        let op = Operation::new(A, 0).retain(3).delete(2).insert("p!");
        assert_eq!(op.apply("hello").unwrap(), "help!");
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let op = Operation::insert_at(A, 0, 3, 1, "ß");
        assert_eq!(op.apply("héy").unwrap(), "hßéy");
    }

    #[test]
    fn test_validate_rejects_wrong_length() {
        let op = Operation::new(A, 0).retain(4);
        assert_eq!(
            op.apply("hello"),
            Err(OtError::LengthMismatch { expected: 4, actual: 5 })
        );
        assert!(op.validate(4).is_ok());
    }

    #[test]
    fn test_insert_at_and_delete_range_clamp() {
        let ins = Operation::insert_at(A, 0, 3, 10, "!");
        assert_eq!(ins.apply("abc").unwrap(), "abc!");

        let del = Operation::delete_range(A, 0, 5, 1, 99);
        assert_eq!(del.apply("hello").unwrap(), "h");
    }

    #[test]
    fn test_invert_restores_original() {
        let original = "the quick fox";
        let op = Operation::new(A, 0).retain(4).delete(5).insert("slow").retain(4);
        let edited = op.apply(original).unwrap();
        assert_eq!(edited, "the slow fox");

        let inverse = op.invert(original).unwrap();
        assert_eq!(inverse.apply(&edited).unwrap(), original);
    }

    #[test]
    fn test_compose_equals_sequential_apply() {
        let text = "hello";
        let first = Operation::new(A, 0).retain(5).insert(" world");
        let second = Operation::new(A, 1).delete(1).insert("J").retain(10);
        let composed = first.compose(&second).unwrap();

        let sequential = second.apply(&first.apply(text).unwrap()).unwrap();
        assert_eq!(composed.apply(text).unwrap(), sequential);
        assert_eq!(sequential, "Jello world");
        assert_eq!(composed.revision, 0);
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let first = Operation::new(A, 0).retain(2).insert("xyz");
        let second = Operation::new(A, 1).retain(2).delete(3);
        let composed = first.compose(&second).unwrap();
        assert!(composed.is_noop());
        assert_eq!(composed.apply("ab").unwrap(), "ab");
    }

    #[test]
    fn test_compose_length_mismatch() {
        let first = Operation::new(A, 0).retain(2);
        let second = Operation::new(A, 1).retain(3);
        assert_eq!(
            first.compose(&second),
            Err(OtError::ComposeMismatch { first: 2, second: 3 })
        );
    }

    #[test]
    fn test_transform_index() {
        // "hello" -> "heXllo"
        let ins = Operation::insert_at(A, 0, 5, 2, "X");
        assert_eq!(ins.transform_index(1), 1);
        assert_eq!(ins.transform_index(2), 3);
        assert_eq!(ins.transform_index(5), 6);

        // "hello" -> "ho"
        let del = Operation::delete_range(A, 0, 5, 1, 4);
        assert_eq!(del.transform_index(0), 0);
        assert_eq!(del.transform_index(2), 1);
        assert_eq!(del.transform_index(5), 2);
    }

    #[test]
    fn test_serde_recomputes_lengths() {
        let op = Operation::new(ClientId(7), 3).retain(2).insert("hi").delete(1);
        let json = serde_json::to_string(&op).unwrap();
        let decoded: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(decoded.base_len(), 3);
        assert_eq!(decoded.target_len(), 4);
    }

    #[test]
    fn test_serde_rejects_empty_component() {
        let json = r#"{"client_id":1,"revision":0,"components":[{"Retain":0}]}"#;
        assert!(serde_json::from_str::<Operation>(json).is_err());
    }

    #[test]
    fn test_display() {
        let op = Operation::new(ClientId(2), 4).retain(1).insert("a");
        assert_eq!(op.to_string(), "client-2@4[retain 1, insert \"a\"]");
    }
}
