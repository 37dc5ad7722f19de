//! `TextOperation`: the OT primitive.
//!
//! An operation is an ordered sequence of atoms — `Retain`, `Insert`, `Delete`
//! — built through [`TextOperation::builder`] (or the convenience
//! constructors) and frozen once handed to another component. Positions and
//! lengths are UTF-8 byte offsets into the document string (see
//! `SPEC_FULL.md` §3.1 for why this crate commits to byte offsets rather than
//! UTF-16 code units).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// A single atom of a [`TextOperation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    /// Advance `n` bytes of the base document unchanged.
    Retain(usize),
    /// Insert the given string at the current cursor.
    Insert(String),
    /// Remove `n` bytes from the base document.
    Delete(usize),
}

/// An immutable, canonical sequence of retain/insert/delete atoms.
///
/// Canonical form: no two adjacent atoms share a variant (they are merged on
/// append), and an Insert always precedes a Delete when both land at the
/// same cursor position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextOperation {
    atoms: Vec<Atom>,
    base_length: usize,
    target_length: usize,
}

impl TextOperation {
    /// An empty operation: `baseLength == targetLength == 0`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn base_length(&self) -> usize {
        self.base_length
    }

    pub fn target_length(&self) -> usize {
        self.target_length
    }

    pub fn is_noop(&self) -> bool {
        self.atoms.is_empty() || (self.atoms.len() == 1 && matches!(self.atoms[0], Atom::Retain(n) if n == self.base_length))
    }

    /// Append a retain of `n` bytes. `n == 0` is a no-op.
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_length += n;
        self.target_length += n;
        if let Some(Atom::Retain(last)) = self.atoms.last_mut() {
            *last += n;
        } else {
            self.atoms.push(Atom::Retain(n));
        }
        self
    }

    /// Append an insert of `s`. Empty strings are a no-op. Maintains the
    /// insert-before-delete canonical ordering: if the last atom is a
    /// pending `Delete`, the new insert is spliced in just before it.
    pub fn insert(&mut self, s: impl Into<String>) -> &mut Self {
        let s = s.into();
        if s.is_empty() {
            return self;
        }
        self.target_length += s.len();
        let len = self.atoms.len();
        if let Some(Atom::Insert(last)) = self.atoms.last_mut() {
            last.push_str(&s);
            return self;
        }
        if len >= 1 && matches!(self.atoms[len - 1], Atom::Delete(_)) {
            if len >= 2 {
                if let Atom::Insert(prev) = &mut self.atoms[len - 2] {
                    prev.push_str(&s);
                    return self;
                }
            }
            self.atoms.insert(len - 1, Atom::Insert(s));
            return self;
        }
        self.atoms.push(Atom::Insert(s));
        self
    }

    /// Append a delete of `n` bytes. `n == 0` is a no-op.
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_length += n;
        if let Some(Atom::Delete(last)) = self.atoms.last_mut() {
            *last += n;
        } else {
            self.atoms.push(Atom::Delete(n));
        }
        self
    }

    /// Apply this operation to `base`, producing a string of length
    /// `target_length`.
    pub fn apply(&self, base: &str) -> CoreResult<String> {
        if base.len() != self.base_length {
            return Err(CoreError::LengthMismatch {
                base: self.base_length,
                input: base.len(),
            });
        }
        let mut result = String::with_capacity(self.target_length);
        let mut pos = 0usize;
        for atom in &self.atoms {
            match atom {
                Atom::Retain(n) => {
                    let end = pos + n;
                    if end > base.len() {
                        return Err(CoreError::OverRetain {
                            retain: *n,
                            base_len: base.len(),
                        });
                    }
                    let slice = base
                        .get(pos..end)
                        .ok_or(CoreError::InvalidBoundary { pos: end })?;
                    result.push_str(slice);
                    pos = end;
                }
                Atom::Insert(s) => result.push_str(s),
                Atom::Delete(n) => {
                    let end = pos + n;
                    if end > base.len() {
                        return Err(CoreError::OverRetain {
                            retain: *n,
                            base_len: base.len(),
                        });
                    }
                    if !base.is_char_boundary(pos) || !base.is_char_boundary(end) {
                        return Err(CoreError::InvalidBoundary { pos: end });
                    }
                    pos = end;
                }
            }
        }
        Ok(result)
    }

    /// Compose `self` then `other`: `compose(a, b).apply(s) ==
    /// b.apply(a.apply(s))`.
    pub fn compose(&self, other: &TextOperation) -> CoreResult<TextOperation> {
        if self.target_length != other.base_length {
            return Err(CoreError::ComposeLengthMismatch {
                lhs_target: self.target_length,
                rhs_base: other.base_length,
            });
        }
        let mut result = TextOperation::new();
        let mut walk = DualWalk::new(&self.atoms, &other.atoms);
        loop {
            match (walk.take1(), walk.take2()) {
                (None, None) => break,
                (Some(Atom::Delete(n)), op2) => {
                    result.delete(n);
                    walk.put_back2(op2);
                }
                (op1, Some(Atom::Insert(s))) => {
                    result.insert(s);
                    walk.put_back1(op1);
                }
                (None, Some(_)) => return Err(CoreError::ComposeUnderrun),
                (Some(_), None) => return Err(CoreError::ComposeOverrun),
                (Some(Atom::Retain(r1)), Some(Atom::Retain(r2))) => {
                    let min = r1.min(r2);
                    result.retain(min);
                    if r1 > min {
                        walk.put_back1(Some(Atom::Retain(r1 - min)));
                    }
                    if r2 > min {
                        walk.put_back2(Some(Atom::Retain(r2 - min)));
                    }
                }
                (Some(Atom::Insert(s)), Some(Atom::Retain(r2))) => {
                    let min = s.len().min(r2);
                    let (head, tail) = split_str(&s, min)?;
                    result.insert(head);
                    if !tail.is_empty() {
                        walk.put_back1(Some(Atom::Insert(tail.to_string())));
                    }
                    if r2 > min {
                        walk.put_back2(Some(Atom::Retain(r2 - min)));
                    }
                }
                (Some(Atom::Insert(s)), Some(Atom::Delete(d2))) => {
                    let min = s.len().min(d2);
                    let (_, tail) = split_str(&s, min)?;
                    if !tail.is_empty() {
                        walk.put_back1(Some(Atom::Insert(tail.to_string())));
                    }
                    if d2 > min {
                        walk.put_back2(Some(Atom::Delete(d2 - min)));
                    }
                }
                (Some(Atom::Retain(r1)), Some(Atom::Delete(d2))) => {
                    let min = r1.min(d2);
                    result.delete(min);
                    if r1 > min {
                        walk.put_back1(Some(Atom::Retain(r1 - min)));
                    }
                    if d2 > min {
                        walk.put_back2(Some(Atom::Delete(d2 - min)));
                    }
                }
            }
        }
        Ok(result)
    }

    /// Produce a commuting pair `(a', b')` such that applying `a` then `b'`
    /// yields the same string as applying `b` then `a'`. When both sides
    /// insert at the same position, `self`'s insert is emitted first (the
    /// left-hand tie-break).
    pub fn transform(&self, other: &TextOperation) -> CoreResult<(TextOperation, TextOperation)> {
        if self.base_length != other.base_length {
            return Err(CoreError::TransformLengthMismatch {
                a_base: self.base_length,
                b_base: other.base_length,
            });
        }
        let mut a_prime = TextOperation::new();
        let mut b_prime = TextOperation::new();
        let mut walk = DualWalk::new(&self.atoms, &other.atoms);
        loop {
            let op1 = walk.take1();
            let op2 = walk.take2();
            match (op1, op2) {
                (None, None) => break,
                (Some(Atom::Insert(s)), op2) => {
                    let len = s.len();
                    a_prime.insert(s);
                    b_prime.retain(len);
                    walk.put_back2(op2);
                }
                (op1, Some(Atom::Insert(s))) => {
                    let len = s.len();
                    a_prime.retain(len);
                    b_prime.insert(s);
                    walk.put_back1(op1);
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(CoreError::TransformLengthMismatch {
                        a_base: self.base_length,
                        b_base: other.base_length,
                    });
                }
                (Some(Atom::Retain(r1)), Some(Atom::Retain(r2))) => {
                    let min = r1.min(r2);
                    a_prime.retain(min);
                    b_prime.retain(min);
                    if r1 > min {
                        walk.put_back1(Some(Atom::Retain(r1 - min)));
                    }
                    if r2 > min {
                        walk.put_back2(Some(Atom::Retain(r2 - min)));
                    }
                }
                (Some(Atom::Delete(d1)), Some(Atom::Delete(d2))) => {
                    let min = d1.min(d2);
                    if d1 > min {
                        walk.put_back1(Some(Atom::Delete(d1 - min)));
                    }
                    if d2 > min {
                        walk.put_back2(Some(Atom::Delete(d2 - min)));
                    }
                }
                (Some(Atom::Delete(d1)), Some(Atom::Retain(r2))) => {
                    let min = d1.min(r2);
                    a_prime.delete(min);
                    if d1 > min {
                        walk.put_back1(Some(Atom::Delete(d1 - min)));
                    }
                    if r2 > min {
                        walk.put_back2(Some(Atom::Retain(r2 - min)));
                    }
                }
                (Some(Atom::Retain(r1)), Some(Atom::Delete(d2))) => {
                    let min = r1.min(d2);
                    b_prime.delete(min);
                    if r1 > min {
                        walk.put_back1(Some(Atom::Retain(r1 - min)));
                    }
                    if d2 > min {
                        walk.put_back2(Some(Atom::Delete(d2 - min)));
                    }
                }
            }
        }
        Ok((a_prime, b_prime))
    }

    /// Map a byte position through `op`. `insert_before` selects the
    /// left-hand tie-break when an insert lands exactly at `pos`.
    pub fn transform_position(pos: usize, op: &TextOperation, insert_before: bool) -> usize {
        let mut index = 0usize;
        let mut new_pos = pos;
        for atom in &op.atoms {
            match atom {
                Atom::Retain(n) => index += n,
                Atom::Insert(s) => {
                    if index < pos || (index == pos && insert_before) {
                        new_pos += s.len();
                    }
                }
                Atom::Delete(n) => {
                    let overlap = (*n).min(pos.saturating_sub(index));
                    new_pos = new_pos.saturating_sub(overlap);
                    index += n;
                }
            }
        }
        new_pos.min(op.target_length)
    }

    /// Wire form: positive ints are retains, negative ints are delete
    /// magnitudes, strings are inserts.
    pub fn to_wire(&self) -> Value {
        let elements: Vec<Value> = self
            .atoms
            .iter()
            .map(|atom| match atom {
                Atom::Retain(n) => Value::from(*n as i64),
                Atom::Delete(n) => Value::from(-(*n as i64)),
                Atom::Insert(s) => Value::from(s.clone()),
            })
            .collect();
        Value::Array(elements)
    }

    /// Parse the wire form, rebuilding canonical form through the builder.
    pub fn from_wire(value: &Value) -> CoreResult<TextOperation> {
        let elements = value
            .as_array()
            .ok_or(CoreError::WireFormatError { index: 0 })?;
        let mut op = TextOperation::new();
        for (index, element) in elements.iter().enumerate() {
            if let Some(s) = element.as_str() {
                op.insert(s);
            } else if let Some(n) = element.as_i64() {
                if n > 0 {
                    op.retain(n as usize);
                } else if n < 0 {
                    op.delete((-n) as usize);
                }
                // n == 0 never appears on the wire (builders drop no-ops).
            } else {
                return Err(CoreError::WireFormatError { index });
            }
        }
        Ok(op)
    }
}

/// Split `s` at byte offset `at`, failing on interior multi-byte scalars.
fn split_str(s: &str, at: usize) -> CoreResult<(&str, &str)> {
    if at > s.len() || !s.is_char_boundary(at) {
        return Err(CoreError::InvalidBoundary { pos: at });
    }
    Ok(s.split_at(at))
}

/// A pair of atom cursors with one-slot lookahead/pushback each, used by
/// `compose` and `transform` to walk two atom sequences in lockstep while
/// splitting atoms on length mismatch.
struct DualWalk<'a> {
    left: std::slice::Iter<'a, Atom>,
    right: std::slice::Iter<'a, Atom>,
    pending_left: Option<Atom>,
    pending_right: Option<Atom>,
}

impl<'a> DualWalk<'a> {
    fn new(left: &'a [Atom], right: &'a [Atom]) -> Self {
        Self {
            left: left.iter(),
            right: right.iter(),
            pending_left: None,
            pending_right: None,
        }
    }

    fn take1(&mut self) -> Option<Atom> {
        self.pending_left.take().or_else(|| self.left.next().cloned())
    }

    fn take2(&mut self) -> Option<Atom> {
        self.pending_right.take().or_else(|| self.right.next().cloned())
    }

    fn put_back1(&mut self, atom: Option<Atom>) {
        self.pending_left = atom;
    }

    fn put_back2(&mut self, atom: Option<Atom>) {
        self.pending_right = atom;
    }
}
