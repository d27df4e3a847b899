//! Trust lattice: partially ordered trust levels with a fail-closed meet.
//!
//! A [`TrustLattice`] is built once at startup and never mutated. The full
//! dominance relation and the meet table are precomputed at build time, so
//! every runtime query is a table lookup. Levels are opaque [`TrustLevel`]
//! tokens stamped with the identity of the lattice that issued them; a token
//! from another lattice never dominates anything and always meets to bottom.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tracing::warn;

/// Upper bound on the number of levels in one lattice.
pub const MAX_LEVELS: usize = 64;

static NEXT_LATTICE_ID: AtomicU32 = AtomicU32::new(1);

/// Configuration error raised while building a [`TrustLattice`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LatticeError {
    /// No levels were declared.
    #[error("trust lattice must define at least one level")]
    Empty,
    /// A level name was empty.
    #[error("trust level name must be non-empty")]
    EmptyName,
    /// A level was declared twice.
    #[error("duplicate trust level '{name}'")]
    DuplicateLevel {
        /// The repeated name.
        name: String,
    },
    /// An ordering pair or lookup named an undeclared level.
    #[error("unknown trust level '{name}'")]
    UnknownLevel {
        /// The undeclared name.
        name: String,
    },
    /// The declared order is not antisymmetric.
    #[error("trust order is cyclic between '{a}' and '{b}'")]
    CyclicOrder {
        /// First level on the cycle.
        a: String,
        /// Second level on the cycle.
        b: String,
    },
    /// Two levels have no greatest lower bound, so `meet` is undefined.
    #[error("trust levels '{a}' and '{b}' have no greatest lower bound")]
    NoGreatestLowerBound {
        /// First level of the pair.
        a: String,
        /// Second level of the pair.
        b: String,
    },
    /// More than [`MAX_LEVELS`] levels were declared.
    #[error("trust lattice exceeds {max} levels")]
    TooManyLevels {
        /// The configured maximum.
        max: usize,
    },
}

/// Opaque trust level issued by a [`TrustLattice`].
///
/// Runtime representation is a pair of small integers. Only the issuing
/// lattice can interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrustLevel {
    lattice: u32,
    index: usize,
}

/// Immutable trust lattice.
pub struct TrustLattice {
    id: u32,
    names: Vec<String>,
    by_name: HashMap<String, usize>,
    /// `dominates[a][b]` holds when `a` is at least as trusted as `b`.
    dominates: Vec<Vec<bool>>,
    meets: Vec<Vec<usize>>,
    bottom: usize,
}

impl fmt::Debug for TrustLattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustLattice")
            .field("id", &self.id)
            .field("levels", &self.names)
            .finish()
    }
}

/// Builder for a [`TrustLattice`] with an arbitrary partial order.
#[derive(Debug, Default, Clone)]
pub struct TrustLatticeBuilder {
    names: Vec<String>,
    pairs: Vec<(String, String)>,
}

impl TrustLatticeBuilder {
    /// Declare a level.
    #[must_use]
    pub fn level(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    /// Declare that `higher` dominates `lower`. Transitivity is implied.
    #[must_use]
    pub fn order(mut self, higher: impl Into<String>, lower: impl Into<String>) -> Self {
        self.pairs.push((higher.into(), lower.into()));
        self
    }

    /// Validate the declared order and precompute the dominance and meet tables.
    ///
    /// # Errors
    ///
    /// Returns a [`LatticeError`] if the levels are empty, duplicated or
    /// unknown, if the order is cyclic, or if some pair of levels lacks a
    /// greatest lower bound.
    pub fn build(self) -> Result<TrustLattice, LatticeError> {
        if self.names.is_empty() {
            return Err(LatticeError::Empty);
        }
        if self.names.len() > MAX_LEVELS {
            return Err(LatticeError::TooManyLevels { max: MAX_LEVELS });
        }

        let mut by_name = HashMap::with_capacity(self.names.len());
        for (index, name) in self.names.iter().enumerate() {
            if name.is_empty() {
                return Err(LatticeError::EmptyName);
            }
            if by_name.insert(name.clone(), index).is_some() {
                return Err(LatticeError::DuplicateLevel { name: name.clone() });
            }
        }

        let n = self.names.len();
        let mut dominates = vec![vec![false; n]; n];
        for (i, row) in dominates.iter_mut().enumerate() {
            row[i] = true;
        }
        for (higher, lower) in &self.pairs {
            let h = lookup(&by_name, higher)?;
            let l = lookup(&by_name, lower)?;
            dominates[h][l] = true;
        }

        // Reflexive-transitive closure (Warshall).
        for k in 0..n {
            for i in 0..n {
                if !dominates[i][k] {
                    continue;
                }
                for j in 0..n {
                    if dominates[k][j] {
                        dominates[i][j] = true;
                    }
                }
            }
        }

        for i in 0..n {
            for j in 0..n {
                if i != j && dominates[i][j] && dominates[j][i] {
                    return Err(LatticeError::CyclicOrder {
                        a: self.names[i].clone(),
                        b: self.names[j].clone(),
                    });
                }
            }
        }

        let mut meets = vec![vec![0usize; n]; n];
        for a in 0..n {
            for b in 0..n {
                meets[a][b] = greatest_lower_bound(&dominates, a, b).ok_or_else(|| {
                    LatticeError::NoGreatestLowerBound {
                        a: self.names[a].clone(),
                        b: self.names[b].clone(),
                    }
                })?;
            }
        }

        let bottom = (0..n).fold(0, |acc, i| meets[acc][i]);

        Ok(TrustLattice {
            id: NEXT_LATTICE_ID.fetch_add(1, Ordering::Relaxed),
            names: self.names,
            by_name,
            dominates,
            meets,
            bottom,
        })
    }
}

fn lookup(by_name: &HashMap<String, usize>, name: &str) -> Result<usize, LatticeError> {
    by_name
        .get(name)
        .copied()
        .ok_or_else(|| LatticeError::UnknownLevel {
            name: name.to_owned(),
        })
}

/// The lower bound of `a` and `b` that dominates every other lower bound.
fn greatest_lower_bound(dominates: &[Vec<bool>], a: usize, b: usize) -> Option<usize> {
    let lower: Vec<usize> = (0..dominates.len())
        .filter(|&c| dominates[a][c] && dominates[b][c])
        .collect();
    lower
        .iter()
        .copied()
        .find(|&c| lower.iter().all(|&d| dominates[c][d]))
}

impl TrustLattice {
    /// Start building a lattice with an explicit partial order.
    pub fn builder() -> TrustLatticeBuilder {
        TrustLatticeBuilder::default()
    }

    /// Build a totally ordered lattice from names listed lowest first.
    ///
    /// # Errors
    ///
    /// Returns a [`LatticeError`] for an empty or duplicated name list.
    pub fn linear<S: AsRef<str>>(names: &[S]) -> Result<Self, LatticeError> {
        let mut builder = Self::builder();
        for name in names {
            builder = builder.level(name.as_ref());
        }
        for pair in names.windows(2) {
            if let [lower, higher] = pair {
                builder = builder.order(higher.as_ref(), lower.as_ref());
            }
        }
        builder.build()
    }

    /// Whether `level` was issued by this lattice.
    pub fn contains(&self, level: TrustLevel) -> bool {
        level.lattice == self.id && level.index < self.names.len()
    }

    /// Whether `a` is at least as trusted as `b`.
    ///
    /// Levels from another lattice never dominate and are never dominated.
    pub fn dominates(&self, a: TrustLevel, b: TrustLevel) -> bool {
        if !self.contains(a) || !self.contains(b) {
            warn!(lattice = self.id, "dominates called with a foreign trust level");
            return false;
        }
        self.dominates[a.index][b.index]
    }

    /// Greatest lower bound of `a` and `b`.
    ///
    /// The result is never more trusted than either input. A foreign level
    /// collapses the result to [`bottom`](Self::bottom).
    pub fn meet(&self, a: TrustLevel, b: TrustLevel) -> TrustLevel {
        if !self.contains(a) || !self.contains(b) {
            warn!(lattice = self.id, "meet called with a foreign trust level");
            return self.bottom();
        }
        self.token(self.meets[a.index][b.index])
    }

    /// Meet of every level in `levels`, or `None` when empty.
    pub fn meet_all(&self, levels: impl IntoIterator<Item = TrustLevel>) -> Option<TrustLevel> {
        levels.into_iter().reduce(|acc, level| self.meet(acc, level))
    }

    /// The least trusted level.
    pub fn bottom(&self) -> TrustLevel {
        self.token(self.bottom)
    }

    /// The level that dominates every other level, if one exists.
    pub fn top(&self) -> Option<TrustLevel> {
        (0..self.names.len())
            .find(|&i| self.dominates[i].iter().all(|&d| d))
            .map(|i| self.token(i))
    }

    /// Look up a level by name.
    pub fn level(&self, name: &str) -> Option<TrustLevel> {
        self.by_name.get(name).map(|&i| self.token(i))
    }

    /// Look up a level by name, failing on unknown names.
    ///
    /// Intended for startup wiring, where an unknown name is a configuration
    /// error rather than a runtime outcome.
    ///
    /// # Errors
    ///
    /// Returns [`LatticeError::UnknownLevel`] when `name` was never declared.
    pub fn require(&self, name: &str) -> Result<TrustLevel, LatticeError> {
        self.level(name).ok_or_else(|| LatticeError::UnknownLevel {
            name: name.to_owned(),
        })
    }

    /// Name of `level`, or `None` for a foreign level.
    pub fn name(&self, level: TrustLevel) -> Option<&str> {
        if !self.contains(level) {
            return None;
        }
        self.names.get(level.index).map(String::as_str)
    }

    /// All levels in declaration order.
    pub fn levels(&self) -> impl Iterator<Item = TrustLevel> + '_ {
        (0..self.names.len()).map(|i| self.token(i))
    }

    /// Number of declared levels.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false; an empty lattice cannot be built.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn token(&self, index: usize) -> TrustLevel {
        TrustLevel {
            lattice: self.id,
            index,
        }
    }
}
