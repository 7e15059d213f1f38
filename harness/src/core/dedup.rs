//! Run-length collapsing for repeated log lines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A value together with how many consecutive times it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repeated<T> {
    pub value: T,
    pub count: u32,
}

impl<T> Repeated<T> {
    pub fn once(value: T) -> Self {
        Self { value, count: 1 }
    }
}

impl<T: fmt::Display> fmt::Display for Repeated<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count > 1 {
            write!(f, "{} (x{})", self.value, self.count)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// Collapse consecutive equal items into counted entries, preserving first-seen order.
pub fn collapse<T: PartialEq, I: IntoIterator<Item = T>>(items: I) -> Vec<Repeated<T>> {
    merge(items.into_iter().map(Repeated::once))
}

/// Merge adjacent entries holding equal values by summing their counts.
///
/// Merging an already merged sequence returns it unchanged.
pub fn merge<T: PartialEq, I: IntoIterator<Item = Repeated<T>>>(entries: I) -> Vec<Repeated<T>> {
    let mut out: Vec<Repeated<T>> = Vec::new();
    for entry in entries {
        match out.last_mut() {
            Some(last) if last.value == entry.value => {
                last.count = last.count.saturating_add(entry.count);
            }
            _ => out.push(entry),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies consecutive duplicates collapse while order is kept.
    #[test]
    fn collapse_counts_consecutive_runs() {
        let collapsed = collapse(["a", "a", "b", "a", "a", "a"]);
        let rendered: Vec<String> = collapsed.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["a (x2)", "b", "a (x3)"]);
    }

    /// Verifies merging is idempotent.
    #[test]
    fn merge_is_idempotent() {
        let once = collapse(vec!["x", "x", "y"]);
        let twice = merge(once.clone());
        assert_eq!(once, twice);
    }

    /// Verifies empty input yields no entries.
    #[test]
    fn collapse_empty() {
        let collapsed: Vec<Repeated<&str>> = collapse(Vec::new());
        assert!(collapsed.is_empty());
    }
}
