//! Operational transformation of concurrent operations.
//!
//! Given `A` and `B` composed against the same document state `S`,
//! [`transform`] yields `(A', B')` with
//!
//! ```text
//!        A            B'
//!   S ───────► S·A ───────► S·A·B'
//!   │                          ║
//!   └───────► S·B ───────► S·B·A'
//!        B            A'
//! ```
//!
//! Rules:
//! - an insert facing a retain or delete is emitted first;
//! - two inserts at the same position are ordered by client id, lower first;
//! - a delete never removes text inserted concurrently, it skips over it;
//! - overlapping deletes remove the shared span once.
//!
//! The engine holds no state and may be called from any thread.

use crate::error::OtError;
use crate::operation::{Component, Operation};

/// Transform two concurrent operations against each other.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    if a.base_len() != b.base_len() {
        return Err(OtError::NotConcurrent {
            left: a.base_len(),
            right: b.base_len(),
        });
    }

    let mismatch = || OtError::NotConcurrent {
        left: a.base_len(),
        right: b.base_len(),
    };

    // Equal ids only happen for a misbehaving client; the left operand wins.
    let a_first = a.client_id <= b.client_id;

    let mut a_prime = Operation::new(a.client_id, a.revision);
    let mut b_prime = Operation::new(b.client_id, b.revision);
    let mut ops1 = a.components().iter().cloned();
    let mut ops2 = b.components().iter().cloned();
    let mut x = ops1.next();
    let mut y = ops2.next();

    loop {
        match (x, y) {
            (None, None) => break,

            (Some(Component::Insert(s1)), Some(Component::Insert(s2))) => {
                if a_first {
                    a_prime.push_insert(&s1);
                    b_prime.push_retain(s1.chars().count());
                    x = ops1.next();
                    y = Some(Component::Insert(s2));
                } else {
                    b_prime.push_insert(&s2);
                    a_prime.push_retain(s2.chars().count());
                    x = Some(Component::Insert(s1));
                    y = ops2.next();
                }
            }
            (Some(Component::Insert(s)), rest) => {
                a_prime.push_insert(&s);
                b_prime.push_retain(s.chars().count());
                x = ops1.next();
                y = rest;
            }
            (rest, Some(Component::Insert(s))) => {
                a_prime.push_retain(s.chars().count());
                b_prime.push_insert(&s);
                x = rest;
                y = ops2.next();
            }

            (None, _) | (_, None) => return Err(mismatch()),

            (Some(Component::Retain(n)), Some(Component::Retain(m))) => {
                let k = n.min(m);
                a_prime.push_retain(k);
                b_prime.push_retain(k);
                x = if n > k { Some(Component::Retain(n - k)) } else { ops1.next() };
                y = if m > k { Some(Component::Retain(m - k)) } else { ops2.next() };
            }
            (Some(Component::Delete(n)), Some(Component::Delete(m))) => {
                // Both sides already removed the shared span.
                let k = n.min(m);
                x = if n > k { Some(Component::Delete(n - k)) } else { ops1.next() };
                y = if m > k { Some(Component::Delete(m - k)) } else { ops2.next() };
            }
            (Some(Component::Delete(n)), Some(Component::Retain(m))) => {
                let k = n.min(m);
                a_prime.push_delete(k);
                x = if n > k { Some(Component::Delete(n - k)) } else { ops1.next() };
                y = if m > k { Some(Component::Retain(m - k)) } else { ops2.next() };
            }
            (Some(Component::Retain(n)), Some(Component::Delete(m))) => {
                let k = n.min(m);
                b_prime.push_delete(k);
                x = if n > k { Some(Component::Retain(n - k)) } else { ops1.next() };
                y = if m > k { Some(Component::Delete(m - k)) } else { ops2.next() };
            }
        }
    }

    Ok((a_prime, b_prime))
}

/// Rebase `op` over a run of operations that were applied after its base state.
///
/// `history` must be ordered oldest first; each entry is transformed pairwise
/// in sequence, which is how N-way concurrency is resolved.
pub fn transform_against<'a, I>(op: &Operation, history: I) -> Result<Operation, OtError>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut rebased = op.clone();
    for applied in history {
        let (next, _) = transform(&rebased, applied)?;
        rebased = next;
    }
    Ok(rebased)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ClientId;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn converge(text: &str, a: &Operation, b: &Operation) -> (String, String) {
        let (a_prime, b_prime) = transform(a, b).unwrap();
        let left = b_prime.apply(&a.apply(text).unwrap()).unwrap();
        let right = a_prime.apply(&b.apply(text).unwrap()).unwrap();
        (left, right)
    }

    #[test]
    fn test_concurrent_inserts_same_position_lower_id_first() {
        let a = Operation::insert_at(A, 0, 0, 0, "hello");
        let b = Operation::insert_at(B, 0, 0, 0, "world");

        let (left, right) = converge("", &a, &b);
        assert_eq!(left, "helloworld");
        assert_eq!(right, "helloworld");

        // Argument order does not change the outcome.
        let (left, right) = converge("", &b, &a);
        assert_eq!(left, "helloworld");
        assert_eq!(right, "helloworld");
    }

    #[test]
    fn test_rebased_insert_lands_after_lower_id() {
        let a = Operation::insert_at(A, 0, 0, 0, "hello");
        let b = Operation::insert_at(B, 0, 0, 0, "world");
        let (b_prime, _) = transform(&b, &a).unwrap();
        assert_eq!(
            b_prime.components(),
            &[Component::Retain(5), Component::Insert("world".into())]
        );
    }

    #[test]
    fn test_delete_preserves_concurrent_insert() {
        let a = Operation::delete_range(A, 1, 5, 0, 5);
        let b = Operation::insert_at(B, 1, 5, 2, "X");

        let (left, right) = converge("hello", &a, &b);
        assert_eq!(left, "X");
        assert_eq!(right, "X");
    }

    #[test]
    fn test_overlapping_deletes() {
        let a = Operation::delete_range(A, 0, 6, 1, 4);
        let b = Operation::delete_range(B, 0, 6, 2, 5);

        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "af");
        assert_eq!(right, "af");
    }

    #[test]
    fn test_insert_inside_deleted_range_from_other_side() {
        let a = Operation::insert_at(A, 0, 6, 3, "XY");
        let b = Operation::delete_range(B, 0, 6, 1, 5);

        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "aXYf");
        assert_eq!(right, "aXYf");
    }

    #[test]
    fn test_noop_transform_is_identity() {
        let noop = Operation::new(A, 0).retain(3);
        let edit = Operation::insert_at(B, 0, 3, 1, "z");
        let (noop_prime, edit_prime) = transform(&noop, &edit).unwrap();
        assert!(noop_prime.is_noop());
        assert_eq!(edit_prime, edit);
    }

    #[test]
    fn test_transform_rejects_different_bases() {
        let a = Operation::new(A, 0).retain(3);
        let b = Operation::new(B, 0).retain(4);
        assert_eq!(
            transform(&a, &b),
            Err(OtError::NotConcurrent { left: 3, right: 4 })
        );
    }

    #[test]
    fn test_transform_keeps_metadata() {
        let a = Operation::insert_at(A, 4, 2, 0, "a");
        let b = Operation::insert_at(B, 4, 2, 2, "b");
        let (a_prime, b_prime) = transform(&a, &b).unwrap();
        assert_eq!((a_prime.client_id, a_prime.revision), (A, 4));
        assert_eq!((b_prime.client_id, b_prime.revision), (B, 4));
    }

    #[test]
    fn test_transform_against_history() {
        // Base "abc"; two ops were applied before ours arrived.
        let first = Operation::insert_at(A, 0, 3, 0, ">");
        let second = Operation::delete_range(ClientId(3), 1, 4, 3, 4);
        let ours = Operation::insert_at(B, 0, 3, 3, "!");

        let rebased = transform_against(&ours, [&first, &second]).unwrap();
        let text = second.apply(&first.apply("abc").unwrap()).unwrap();
        assert_eq!(text, ">ab");
        assert_eq!(rebased.apply(&text).unwrap(), ">ab!");
    }
}
