//! Operation engine contract and the flat-text implementation.
//!
//! The synchronization layer never looks inside an operation. Everything it
//! needs is expressed through [`OperationEngine`]:
//!
//! ```text
//! apply(state, op)            -> state'
//! transform(op, against, side) -> op'    (op rebased to run after `against`)
//! compose(first, second)      -> op      (first, then second)
//! infer_ops(old, new)         -> Option<op>
//! ```
//!
//! [`TextEngine`] is the concrete engine for flat text. A [`TextOp`] walks the
//! source string left to right with `Retain`, `Insert` and `Delete`
//! components, counted in chars. Trailing retains are implicit.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Which operation's inserts go first when both insert at the same offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The operation being transformed wins the tie.
    Left,
    /// The operation transformed against wins the tie.
    Right,
}

/// Text-operation algebra consumed by the synchronization layer.
///
/// Implementations must satisfy the transform property: for ops `a` and `b`
/// made against the same state `s`,
/// `apply(apply(s, a), transform(b, a, Right)) == apply(apply(s, b), transform(a, b, Left))`.
pub trait OperationEngine: Clone + Send + Sync + 'static {
    type Op: Clone + std::fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn apply(&self, state: &str, op: &Self::Op) -> Result<String, SyncError>;

    fn transform(&self, op: &Self::Op, against: &Self::Op, side: Side) -> Self::Op;

    fn compose(&self, first: &Self::Op, second: &Self::Op) -> Self::Op;

    /// Diff two texts. `None` means the texts are identical.
    fn infer_ops(&self, old: &str, new: &str) -> Option<Self::Op>;

    /// Whether applying `op` leaves every text unchanged.
    fn is_noop(&self, op: &Self::Op) -> bool;
}

/// One step of a text operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextComponent {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

impl TextComponent {
    fn is_empty(&self) -> bool {
        match self {
            Self::Retain(n) | Self::Delete(n) => *n == 0,
            Self::Insert(s) => s.is_empty(),
        }
    }
}

/// A normalized sequence of [`TextComponent`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextOp(Vec<TextComponent>);

impl TextOp {
    /// Build an op, merging adjacent components and dropping trailing retains.
    pub fn new(components: impl IntoIterator<Item = TextComponent>) -> Self {
        let mut op = Self(Vec::new());
        for comp in components {
            op.push(comp);
        }
        op.trim();
        op
    }

    /// Insert `text` at char offset `pos`.
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::new([TextComponent::Retain(pos), TextComponent::Insert(text.into())])
    }

    /// Delete `len` chars starting at char offset `pos`.
    pub fn delete(pos: usize, len: usize) -> Self {
        Self::new([TextComponent::Retain(pos), TextComponent::Delete(len)])
    }

    pub fn components(&self) -> &[TextComponent] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, comp: TextComponent) {
        if comp.is_empty() {
            return;
        }
        match (self.0.last_mut(), comp) {
            (Some(TextComponent::Retain(n)), TextComponent::Retain(m)) => *n += m,
            (Some(TextComponent::Delete(n)), TextComponent::Delete(m)) => *n += m,
            (Some(TextComponent::Insert(s)), TextComponent::Insert(t)) => s.push_str(&t),
            (_, comp) => self.0.push(comp),
        }
    }

    fn trim(&mut self) {
        while matches!(self.0.last(), Some(TextComponent::Retain(_))) {
            self.0.pop();
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `s` after `n` chars.
fn split_chars(s: &str, n: usize) -> (String, String) {
    let idx = s.char_indices().nth(n).map_or(s.len(), |(i, _)| i);
    (s[..idx].to_string(), s[idx..].to_string())
}

/// Cursor over an op's components that hands out partial components.
struct Components<'a> {
    iter: std::slice::Iter<'a, TextComponent>,
    held: Option<TextComponent>,
}

impl<'a> Components<'a> {
    fn new(op: &'a TextOp) -> Self {
        Self { iter: op.0.iter(), held: None }
    }

    fn next(&mut self) -> Option<TextComponent> {
        self.held.take().or_else(|| self.iter.next().cloned())
    }

    fn hold(&mut self, comp: TextComponent) {
        if !comp.is_empty() {
            self.held = Some(comp);
        }
    }
}

/// Reference engine for flat text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextEngine;

impl OperationEngine for TextEngine {
    type Op = TextOp;

    fn apply(&self, state: &str, op: &TextOp) -> Result<String, SyncError> {
        let mut chars = state.chars();
        let mut out = String::with_capacity(state.len());
        let overrun = || {
            SyncError::InvalidOperation(format!(
                "operation spans past the end of a {}-char text",
                char_len(state)
            ))
        };

        for comp in &op.0 {
            match comp {
                TextComponent::Retain(n) => {
                    for _ in 0..*n {
                        out.push(chars.next().ok_or_else(overrun)?);
                    }
                }
                TextComponent::Insert(s) => out.push_str(s),
                TextComponent::Delete(n) => {
                    for _ in 0..*n {
                        chars.next().ok_or_else(overrun)?;
                    }
                }
            }
        }
        out.extend(chars);
        Ok(out)
    }

    fn transform(&self, op: &TextOp, against: &TextOp, side: Side) -> TextOp {
        use TextComponent::*;

        let mut out = TextOp::default();
        let mut a = Components::new(op);
        let mut b = Components::new(against);

        loop {
            let (x, y) = (a.next(), b.next());
            match (x, y) {
                (None, _) => break,
                (Some(Insert(s)), y) if side == Side::Left || !matches!(y, Some(Insert(_))) => {
                    out.push(Insert(s));
                    if let Some(y) = y {
                        b.hold(y);
                    }
                }
                (Some(x), Some(Insert(t))) => {
                    out.push(Retain(char_len(&t)));
                    a.hold(x);
                }
                // `against` is exhausted; its tail is an implicit retain.
                (Some(x), None) => out.push(x),
                (Some(Retain(n)), Some(Retain(m))) => {
                    out.push(Retain(n.min(m)));
                    a.hold(Retain(n.saturating_sub(m)));
                    b.hold(Retain(m.saturating_sub(n)));
                }
                (Some(Retain(n)), Some(Delete(m))) => {
                    a.hold(Retain(n.saturating_sub(m)));
                    b.hold(Delete(m.saturating_sub(n)));
                }
                (Some(Delete(n)), Some(Retain(m))) => {
                    out.push(Delete(n.min(m)));
                    a.hold(Delete(n.saturating_sub(m)));
                    b.hold(Retain(m.saturating_sub(n)));
                }
                (Some(Delete(n)), Some(Delete(m))) => {
                    a.hold(Delete(n.saturating_sub(m)));
                    b.hold(Delete(m.saturating_sub(n)));
                }
                (Some(Insert(_)), Some(_)) => unreachable!("insert against non-insert is handled above"),
            }
        }

        out.trim();
        out
    }

    fn compose(&self, first: &TextOp, second: &TextOp) -> TextOp {
        use TextComponent::*;

        let mut out = TextOp::default();
        let mut a = Components::new(first);
        let mut b = Components::new(second);

        loop {
            let (x, y) = (a.next(), b.next());
            match (x, y) {
                (None, None) => break,
                (Some(Delete(n)), y) => {
                    out.push(Delete(n));
                    if let Some(y) = y {
                        b.hold(y);
                    }
                }
                (x, Some(Insert(s))) => {
                    out.push(Insert(s));
                    if let Some(x) = x {
                        a.hold(x);
                    }
                }
                (Some(x), None) => out.push(x),
                (None, Some(y)) => out.push(y),
                (Some(Retain(n)), Some(Retain(m))) => {
                    out.push(Retain(n.min(m)));
                    a.hold(Retain(n.saturating_sub(m)));
                    b.hold(Retain(m.saturating_sub(n)));
                }
                (Some(Retain(n)), Some(Delete(m))) => {
                    out.push(Delete(n.min(m)));
                    a.hold(Retain(n.saturating_sub(m)));
                    b.hold(Delete(m.saturating_sub(n)));
                }
                (Some(Insert(s)), Some(Retain(m))) => {
                    let len = char_len(&s);
                    let (kept, rest) = split_chars(&s, m);
                    out.push(Insert(kept));
                    a.hold(Insert(rest));
                    b.hold(Retain(m.saturating_sub(len)));
                }
                (Some(Insert(s)), Some(Delete(m))) => {
                    let len = char_len(&s);
                    let (_, rest) = split_chars(&s, m);
                    a.hold(Insert(rest));
                    b.hold(Delete(m.saturating_sub(len)));
                }
            }
        }

        out.trim();
        out
    }

    fn infer_ops(&self, old: &str, new: &str) -> Option<TextOp> {
        if old == new {
            return None;
        }
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(&new_chars)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let deleted = old_chars.len() - suffix - prefix;
        let inserted = new_chars.len() - suffix - prefix;

        if deleted > 0 && inserted > 0 {
            let text: String = new_chars[prefix..prefix + inserted].iter().collect();
            return Some(TextOp::new([
                TextComponent::Retain(prefix),
                TextComponent::Delete(deleted),
                TextComponent::Insert(text),
            ]));
        }

        // A pure insert or delete can often slide left over repeated chars.
        // Prefer the slot that starts on a space so word edits stay whole.
        let (text, len) = if inserted > 0 {
            (&new_chars, inserted)
        } else {
            (&old_chars, deleted)
        };
        let mut start = prefix;
        while start > 0 && text[start - 1] == text[start - 1 + len] {
            start -= 1;
        }
        let pos = (start..=prefix).find(|&p| text[p] == ' ').unwrap_or(prefix);

        let edit = if inserted > 0 {
            TextComponent::Insert(text[pos..pos + len].iter().collect())
        } else {
            TextComponent::Delete(len)
        };
        Some(TextOp::new([TextComponent::Retain(pos), edit]))
    }

    fn is_noop(&self, op: &TextOp) -> bool {
        op.0
            .iter()
            .all(|c| c.is_empty() || matches!(c, TextComponent::Retain(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TextComponent::*;

    const E: TextEngine = TextEngine;

    /// Both orders of applying two concurrent ops must land on the same text.
    fn assert_converges(base: &str, a: &TextOp, b: &TextOp) -> String {
        let a_then_b = E
            .apply(&E.apply(base, a).unwrap(), &E.transform(b, a, Side::Right))
            .unwrap();
        let b_then_a = E
            .apply(&E.apply(base, b).unwrap(), &E.transform(a, b, Side::Left))
            .unwrap();
        assert_eq!(a_then_b, b_then_a, "base {base:?}, a {a:?}, b {b:?}");
        a_then_b
    }

    #[test]
    fn test_new_normalizes() {
        let op = TextOp::new([Retain(2), Retain(3), Insert("x".into()), Insert(String::new()), Retain(4)]);
        assert_eq!(op.components(), &[Retain(5), Insert("x".into())]);
        assert!(TextOp::new([Retain(7)]).is_empty());
    }

    #[test]
    fn test_apply_insert_and_delete() {
        assert_eq!(E.apply("hello", &TextOp::insert(5, " world")).unwrap(), "hello world");
        assert_eq!(E.apply("hello world", &TextOp::delete(5, 6)).unwrap(), "hello");
        assert_eq!(E.apply("héllo", &TextOp::delete(1, 1)).unwrap(), "hllo");
    }

    #[test]
    fn test_apply_past_end_is_error() {
        let err = E.apply("abc", &TextOp::delete(2, 5)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
    }

    #[test]
    fn test_infer_ops() {
        assert!(E.infer_ops("same", "same").is_none());
        assert_eq!(E.infer_ops("", "lorem"), Some(TextOp::insert(0, "lorem")));
        assert_eq!(
            E.infer_ops("lorem ipsum", "lorem dolor ipsum"),
            Some(TextOp::insert(5, " dolor"))
        );
        assert_eq!(E.infer_ops("lorem ipsum", "lorem"), Some(TextOp::delete(5, 6)));
        assert_eq!(E.infer_ops("a bb c", "a c"), Some(TextOp::delete(1, 3)));
        assert_eq!(
            E.infer_ops("lorem ipsum", "lorem X"),
            Some(TextOp::new([Retain(6), Delete(5), Insert("X".into())]))
        );

        let op = E.infer_ops("sit amet sit", "sit sit").unwrap();
        assert_eq!(E.apply("sit amet sit", &op).unwrap(), "sit sit");
    }

    #[test]
    fn test_transform_disjoint_edits() {
        let insert = TextOp::insert(5, " dolor");
        let delete = TextOp::delete(5, 6);
        assert_eq!(assert_converges("lorem ipsum", &insert, &delete), "lorem dolor");
    }

    #[test]
    fn test_transform_insert_tie_respects_side() {
        let a = TextOp::insert(0, "A");
        let b = TextOp::insert(0, "B");
        assert_eq!(E.apply("x", &E.transform(&a, &b, Side::Left)).unwrap(), "Ax");
        assert_eq!(E.apply("Bx", &E.transform(&a, &b, Side::Left)).unwrap(), "ABx");
        assert_eq!(E.apply("Bx", &E.transform(&a, &b, Side::Right)).unwrap(), "BAx");
        assert_converges("x", &a, &b);
    }

    #[test]
    fn test_transform_overlapping_deletes() {
        let a = TextOp::delete(1, 3);
        let b = TextOp::delete(2, 3);
        assert_eq!(assert_converges("abcdefg", &a, &b), "afg");

        let same = TextOp::delete(2, 2);
        assert!(E.is_noop(&E.transform(&same, &same, Side::Right)));
    }

    #[test]
    fn test_transform_insert_inside_deleted_span() {
        let a = TextOp::insert(3, "XY");
        let b = TextOp::delete(1, 4);
        assert_eq!(assert_converges("abcdefg", &a, &b), "aXYfg");
    }

    #[test]
    fn test_compose_matches_sequential_apply() {
        let first = TextOp::insert(5, " dolor");
        let second = TextOp::delete(0, 6);
        let composed = E.compose(&first, &second);
        let stepwise = E.apply(&E.apply("lorem ipsum", &first).unwrap(), &second).unwrap();
        assert_eq!(E.apply("lorem ipsum", &composed).unwrap(), stepwise);
        assert_eq!(stepwise, "dolor ipsum");
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let composed = E.compose(&TextOp::insert(2, "zz"), &TextOp::delete(2, 2));
        assert!(E.is_noop(&composed));
    }

    #[test]
    fn test_is_noop() {
        assert!(E.is_noop(&TextOp::default()));
        assert!(!E.is_noop(&TextOp::insert(0, "a")));
        // Deserialized ops are not normalized.
        let raw: TextOp = serde_json::from_str(r#"[{"retain":3},{"insert":""}]"#).unwrap();
        assert!(E.is_noop(&raw));
    }

    #[test]
    fn test_serde_shape() {
        let op = TextOp::new([Retain(2), Delete(1), Insert("hi".into())]);
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"[{"retain":2},{"delete":1},{"insert":"hi"}]"#);
        assert_eq!(serde_json::from_str::<TextOp>(&json).unwrap(), op);
    }
}
