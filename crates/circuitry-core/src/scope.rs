use std::fmt;

use serde::{Deserialize, Serialize};

/// The set of variables a node depends on.
///
/// Stored as a sorted, deduplicated list of variable indices so that equality,
/// union and disjointness checks are linear merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<usize>", into = "Vec<usize>")]
pub struct Scope(Vec<usize>);

impl Scope {
    pub fn new(vars: impl IntoIterator<Item = usize>) -> Self {
        let mut v: Vec<usize> = vars.into_iter().collect();
        v.sort_unstable();
        v.dedup();
        Scope(v)
    }

    pub fn single(var: usize) -> Self {
        Scope(vec![var])
    }

    pub fn vars(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, var: usize) -> bool {
        self.0.binary_search(&var).is_ok()
    }

    /// Largest variable index, if any.
    pub fn max_var(&self) -> Option<usize> {
        self.0.last().copied()
    }

    /// True when the two scopes share no variable.
    pub fn is_disjoint(&self, other: &Scope) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return false,
            }
        }
        true
    }

    /// First variable present in both scopes.
    pub fn first_shared(&self, other: &Scope) -> Option<usize> {
        self.0.iter().copied().find(|v| other.contains(*v))
    }

    /// Sorted merge of two scopes.
    pub fn union(&self, other: &Scope) -> Scope {
        let mut out = Vec::with_capacity(self.0.len() + other.0.len());
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => {
                    out.push(self.0[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(other.0[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    out.push(self.0[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.0[i..]);
        out.extend_from_slice(&other.0[j..]);
        Scope(out)
    }
}

impl From<Vec<usize>> for Scope {
    fn from(v: Vec<usize>) -> Self {
        Scope::new(v)
    }
}

impl From<Scope> for Vec<usize> {
    fn from(s: Scope) -> Self {
        s.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "}}")
    }
}
