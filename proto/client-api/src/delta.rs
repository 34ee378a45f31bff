//! Ordered-op document deltas and their OT algebra.
//!
//! A [`Delta`] is a normalized run of [`DeltaOp`]s over plain text. Two
//! operations make the synchronization core work: [`Delta::compose`]
//! (sequential application collapsed into one delta) and
//! [`Delta::transform`] (rebasing one of two concurrent deltas over the
//! other). Composition is associative but not commutative.

use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Single step of a [`Delta`].
///
/// Counts are in characters, not bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    /// Keeps the next `n` characters untouched.
    Retain(usize),

    /// Inserts the given text at the current position.
    Insert(String),

    /// Removes the next `n` characters.
    Delete(usize),
}

/// Attempt to apply a [`Delta`] past the end of its input text.
#[derive(Clone, Copy, Debug, Display)]
#[display(fmt = "delta spans past the end of its input")]
pub struct DeltaRangeError;

impl std::error::Error for DeltaRangeError {}

/// Normalized sequence of [`DeltaOp`]s.
///
/// Normalization keeps adjacent same-kind ops merged, drops empty ops and
/// drops trailing retains, so structural equality is semantic equality.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta(Vec<DeltaOp>);

impl Delta {
    /// Returns the empty [`Delta`], the identity of [`Delta::compose`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a [`Delta`] from raw ops, normalizing them.
    #[must_use]
    pub fn from_ops<I: IntoIterator<Item = DeltaOp>>(ops: I) -> Self {
        let mut delta = Self::new();
        for op in ops {
            delta.push(op);
        }
        delta.trim();
        delta
    }

    /// Indicates whether this [`Delta`] changes nothing.
    ///
    /// A delta of bare retains counts as empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|op| matches!(op, DeltaOp::Retain(_)))
    }

    /// Borrows the ops of this [`Delta`].
    #[inline]
    #[must_use]
    pub fn ops(&self) -> &[DeltaOp] {
        &self.0
    }

    /// Appends a retain of `n` characters.
    #[must_use]
    pub fn retain(mut self, n: usize) -> Self {
        self.push(DeltaOp::Retain(n));
        self
    }

    /// Appends an insertion of the given `text`.
    #[must_use]
    pub fn insert<T: Into<String>>(mut self, text: T) -> Self {
        self.push(DeltaOp::Insert(text.into()));
        self
    }

    /// Appends a deletion of `n` characters.
    #[must_use]
    pub fn delete(mut self, n: usize) -> Self {
        self.push(DeltaOp::Delete(n));
        self
    }

    /// Pushes an op, merging it with the tail when both are the same kind.
    fn push(&mut self, op: DeltaOp) {
        match &op {
            DeltaOp::Retain(0) | DeltaOp::Delete(0) => return,
            DeltaOp::Insert(text) if text.is_empty() => return,
            _ => (),
        }
        match (self.0.last_mut(), &op) {
            (Some(DeltaOp::Retain(tail)), DeltaOp::Retain(n)) => *tail += n,
            (Some(DeltaOp::Delete(tail)), DeltaOp::Delete(n)) => *tail += n,
            (Some(DeltaOp::Insert(tail)), DeltaOp::Insert(text)) => {
                tail.push_str(text);
            }
            _ => self.0.push(op),
        }
    }

    /// Drops a trailing retain, which changes nothing by definition.
    fn trim(&mut self) {
        if let Some(DeltaOp::Retain(_)) = self.0.last() {
            self.0.pop();
        }
    }

    /// Composes `self` followed by `other` into a single [`Delta`].
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let mut out = Self::new();
        let mut lhs = OpCursor::new(&self.0);
        let mut rhs = OpCursor::new(&other.0);

        loop {
            match (lhs.peek(), rhs.peek()) {
                (_, Some(Chunk::Insert(text))) => {
                    out.push(DeltaOp::Insert(text));
                    rhs.advance_all();
                }
                (Some(Chunk::Delete(n)), _) => {
                    out.push(DeltaOp::Delete(n));
                    lhs.advance_all();
                }
                (None, None) => break,
                (None, Some(chunk)) => {
                    out.push(chunk.into_op());
                    rhs.advance_all();
                }
                (Some(chunk), None) => {
                    out.push(chunk.into_op());
                    lhs.advance_all();
                }
                (Some(left), Some(right)) => {
                    let n = left.len().min(right.len());
                    match (left, right) {
                        (Chunk::Retain(_), Chunk::Retain(_)) => {
                            out.push(DeltaOp::Retain(n));
                        }
                        (Chunk::Retain(_), Chunk::Delete(_)) => {
                            out.push(DeltaOp::Delete(n));
                        }
                        (Chunk::Insert(text), Chunk::Retain(_)) => {
                            out.push(DeltaOp::Insert(take_chars(&text, n)));
                        }
                        // Freshly inserted text deleted right away.
                        (Chunk::Insert(_), Chunk::Delete(_)) => (),
                        _ => unreachable!("insert/delete heads handled above"),
                    }
                    lhs.advance(n);
                    rhs.advance(n);
                }
            }
        }

        out.trim();
        out
    }

    /// Transforms `other` over `self`, both produced concurrently against the
    /// same base document.
    ///
    /// The result applies on top of `self` and carries `other`'s intent.
    /// When both deltas insert at the same position, `self_wins` decides
    /// whose insertion ends up first in the converged document.
    ///
    /// Convergence law: for concurrent `a` and `b`,
    /// `compose(a, a.transform(b, true)) == compose(b, b.transform(a, false))`.
    #[must_use]
    pub fn transform(&self, other: &Self, self_wins: bool) -> Self {
        let mut out = Self::new();
        let mut base = OpCursor::new(&self.0);
        let mut over = OpCursor::new(&other.0);

        loop {
            match (base.peek(), over.peek()) {
                // When both sides insert at the same point the winner's text
                // goes first and the loser retains over it.
                (Some(Chunk::Insert(text)), Some(_)) if self_wins => {
                    out.push(DeltaOp::Retain(text.chars().count()));
                    base.advance_all();
                }
                (_, Some(Chunk::Insert(text))) => {
                    out.push(DeltaOp::Insert(text));
                    over.advance_all();
                }
                (Some(Chunk::Insert(text)), _) => {
                    out.push(DeltaOp::Retain(text.chars().count()));
                    base.advance_all();
                }
                (None, None) => break,
                (None, Some(chunk)) => {
                    out.push(chunk.into_op());
                    over.advance_all();
                }
                (Some(_), None) => {
                    // Base retains or deletes past the end of `other`'s
                    // explicit ops; the implicit tail retain absorbs it.
                    base.advance_all();
                }
                (Some(left), Some(right)) => {
                    let n = left.len().min(right.len());
                    match (left, right) {
                        (Chunk::Retain(_), Chunk::Retain(_)) => {
                            out.push(DeltaOp::Retain(n));
                        }
                        (Chunk::Retain(_), Chunk::Delete(_)) => {
                            out.push(DeltaOp::Delete(n));
                        }
                        // Base already deleted this span; nothing left for
                        // `other` to retain or delete.
                        (Chunk::Delete(_), _) => (),
                        _ => unreachable!("insert heads handled above"),
                    }
                    base.advance(n);
                    over.advance(n);
                }
            }
        }

        out.trim();
        out
    }

    /// Applies this [`Delta`] to `text`.
    ///
    /// # Errors
    ///
    /// With [`DeltaRangeError`] if the delta retains or deletes past the end
    /// of `text`.
    pub fn apply_to(&self, text: &str) -> Result<String, DeltaRangeError> {
        let mut out = String::new();
        let mut rest = text.chars();
        for op in &self.0 {
            match op {
                DeltaOp::Retain(n) => {
                    for _ in 0..*n {
                        out.push(rest.next().ok_or(DeltaRangeError)?);
                    }
                }
                DeltaOp::Insert(inserted) => out.push_str(inserted),
                DeltaOp::Delete(n) => {
                    for _ in 0..*n {
                        rest.next().ok_or(DeltaRangeError)?;
                    }
                }
            }
        }
        out.extend(rest);
        Ok(out)
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, op) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match op {
                DeltaOp::Retain(n) => write!(f, "retain {}", n)?,
                DeltaOp::Insert(text) => write!(f, "insert {:?}", text)?,
                DeltaOp::Delete(n) => write!(f, "delete {}", n)?,
            }
        }
        write!(f, "]")
    }
}

/// Head chunk yielded by an [`OpCursor`].
enum Chunk {
    /// Remainder of a retain run.
    Retain(usize),

    /// Remainder of an insert run.
    Insert(String),

    /// Remainder of a delete run.
    Delete(usize),
}

impl Chunk {
    /// Remaining length of this chunk, in characters.
    fn len(&self) -> usize {
        match self {
            Chunk::Retain(n) | Chunk::Delete(n) => *n,
            Chunk::Insert(text) => text.chars().count(),
        }
    }

    /// Converts this chunk back into a plain op.
    fn into_op(self) -> DeltaOp {
        match self {
            Chunk::Retain(n) => DeltaOp::Retain(n),
            Chunk::Insert(text) => DeltaOp::Insert(text),
            Chunk::Delete(n) => DeltaOp::Delete(n),
        }
    }
}

/// Cursor over an op slice that can consume ops partially.
struct OpCursor<'a> {
    ops: &'a [DeltaOp],
    /// Characters of `ops[0]` already consumed.
    offset: usize,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [DeltaOp]) -> Self {
        Self { ops, offset: 0 }
    }

    /// Returns the not-yet-consumed remainder of the head op.
    fn peek(&self) -> Option<Chunk> {
        let op = self.ops.first()?;
        Some(match op {
            DeltaOp::Retain(n) => Chunk::Retain(n - self.offset),
            DeltaOp::Delete(n) => Chunk::Delete(n - self.offset),
            DeltaOp::Insert(text) => {
                Chunk::Insert(text.chars().skip(self.offset).collect())
            }
        })
    }

    /// Consumes `n` characters of the head op.
    fn advance(&mut self, n: usize) {
        let head_len = match &self.ops[0] {
            DeltaOp::Retain(len) | DeltaOp::Delete(len) => *len,
            DeltaOp::Insert(text) => text.chars().count(),
        };
        self.offset += n;
        debug_assert!(self.offset <= head_len);
        if self.offset >= head_len {
            self.ops = &self.ops[1..];
            self.offset = 0;
        }
    }

    /// Consumes the whole head op.
    fn advance_all(&mut self) {
        if !self.ops.is_empty() {
            self.ops = &self.ops[1..];
            self.offset = 0;
        }
    }
}

/// Takes the first `n` characters of `text`.
fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ins(at: usize, text: &str) -> Delta {
        Delta::new().retain(at).insert(text)
    }

    #[test]
    fn normalization_merges_and_trims() {
        let delta = Delta::from_ops(vec![
            DeltaOp::Retain(2),
            DeltaOp::Retain(3),
            DeltaOp::Insert("ab".into()),
            DeltaOp::Insert("cd".into()),
            DeltaOp::Delete(0),
            DeltaOp::Retain(4),
        ]);
        assert_eq!(
            delta.ops(),
            &[DeltaOp::Retain(5), DeltaOp::Insert("abcd".into())],
        );

        assert!(Delta::new().retain(10).is_empty());
    }

    #[test]
    fn apply_inserts_and_deletes() {
        let delta = Delta::new().retain(5).insert(", brave").delete(0);
        assert_eq!(delta.apply_to("hello world").unwrap(), "hello, brave world");

        let delete = Delta::new().retain(5).delete(6);
        assert_eq!(delete.apply_to("hello world").unwrap(), "hello");

        assert!(Delta::new().retain(12).apply_to("short").is_err());
        assert!(Delta::new().delete(6).apply_to("short").is_err());
    }

    #[test]
    fn compose_is_sequential_application() {
        let text = "abcdef";
        let a = Delta::new().retain(3).insert("X");
        let b = Delta::new().retain(1).delete(2);

        let composed = a.compose(&b);
        assert_eq!(
            composed.apply_to(text).unwrap(),
            b.apply_to(&a.apply_to(text).unwrap()).unwrap(),
        );
    }

    #[test]
    fn compose_cancels_inserted_then_deleted_text() {
        let a = Delta::new().insert("abc");
        let b = Delta::new().delete(3);
        assert!(a.compose(&b).is_empty());
    }

    #[test]
    fn compose_associativity_samples() {
        let text = "the quick brown fox";
        let a = Delta::new().retain(4).insert("very ");
        let b = Delta::new().retain(2).delete(3);
        let c = Delta::new().insert(">> ").retain(5).delete(1);

        let left = a.compose(&b).compose(&c);
        let right = a.compose(&b.compose(&c));
        assert_eq!(left, right);
        assert_eq!(left.apply_to(text).unwrap(), right.apply_to(text).unwrap());
    }

    #[test]
    fn transform_converges() {
        let cases = vec![
            ("hello", ins(0, "X"), ins(0, "Y")),
            ("hello", ins(2, "ab"), Delta::new().retain(1).delete(3)),
            ("hello", Delta::new().delete(2), Delta::new().delete(4)),
            ("hello world", ins(5, "!"), ins(11, "?")),
            ("abc", Delta::new().retain(1).insert("--").delete(1), ins(3, "z")),
        ];

        for (text, a, b) in cases {
            let b_over_a = a.transform(&b, true);
            let a_over_b = b.transform(&a, false);
            assert_eq!(
                a.compose(&b_over_a).apply_to(text).unwrap(),
                b.compose(&a_over_b).apply_to(text).unwrap(),
                "diverged for a={} b={}",
                a,
                b,
            );
        }
    }

    #[test]
    fn transform_tie_break_orders_inserts() {
        let text = "??";
        let a = ins(1, "A");
        let b = ins(1, "B");

        // `a` wins: its insertion lands before `b`'s.
        let merged = a.compose(&a.transform(&b, true));
        assert_eq!(merged.apply_to(text).unwrap(), "?AB?");

        // `a` loses: `b`'s insertion goes first.
        let merged = a.compose(&a.transform(&b, false));
        assert_eq!(merged.apply_to(text).unwrap(), "?BA?");
    }

    #[test]
    fn transform_drops_ops_on_deleted_spans() {
        let base = Delta::new().delete(5);
        let other = Delta::new().retain(2).insert("mid").retain(3);

        let rebased = base.transform(&other, true);
        assert_eq!(rebased.ops(), &[DeltaOp::Insert("mid".into())]);
    }

    #[test]
    fn serde_shape_is_externally_tagged() {
        let delta = Delta::new().retain(2).insert("hi").delete(1);
        let json = serde_json::to_string(&delta).unwrap();
        assert_eq!(
            json,
            r#"[{"retain":2},{"insert":"hi"},{"delete":1}]"#,
        );
        assert_eq!(serde_json::from_str::<Delta>(&json).unwrap(), delta);
    }
}
