//! Prepared statement cache.
//!
//! Maps SQL text to the server-side handle it was prepared under. Entries
//! are only added once the server has acknowledged the prepare and are
//! never evicted: a handle stays valid for the life of the connection.

use std::collections::{HashMap, HashSet};

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{DEFAULT_STATEMENT_NAME_LEN, STATEMENT_NAME_PREFIX};

/// A statement the server has prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// SQL text as submitted.
    pub sql: String,
    /// Server-side handle name.
    pub name: String,
    /// Number of parameters bound at prepare time.
    pub param_count: usize,
}

#[derive(Debug)]
struct CacheEntry {
    statement: PreparedStatement,
    hit_count: u64,
}

/// Cache of acknowledged prepared statements, keyed by SQL text.
#[derive(Debug, Default)]
pub struct StatementCache {
    cache: HashMap<String, CacheEntry>,
}

impl StatementCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the statement prepared for `sql`.
    pub fn lookup(&mut self, sql: &str) -> Option<PreparedStatement> {
        let entry = self.cache.get_mut(sql)?;
        entry.hit_count += 1;
        Some(entry.statement.clone())
    }

    /// Check if `sql` has been prepared.
    pub fn contains(&self, sql: &str) -> bool {
        self.cache.contains_key(sql)
    }

    /// Record an acknowledged prepare. Replaces any earlier entry for the
    /// same SQL.
    pub fn insert(&mut self, statement: PreparedStatement) {
        self.cache.insert(
            statement.sql.clone(),
            CacheEntry {
                statement,
                hit_count: 0,
            },
        );
    }

    /// Number of times `sql` was served from the cache.
    pub fn hits(&self, sql: &str) -> u64 {
        self.cache.get(sql).map_or(0, |e| e.hit_count)
    }

    /// Number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Generates statement handle names for one connection.
///
/// Names are `pgpipe_` followed by `len` random alphanumeric characters.
/// Uniqueness among the names already issued on the connection is
/// guaranteed by retrying on collision.
#[derive(Debug)]
pub struct NameGenerator {
    rng: StdRng,
    len: usize,
    issued: HashSet<String>,
}

impl NameGenerator {
    /// Generator seeded from OS entropy.
    pub fn new(len: usize) -> Self {
        Self::from_rng(StdRng::from_entropy(), len)
    }

    /// Deterministic generator, for tests.
    pub fn with_seed(seed: u64, len: usize) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed), len)
    }

    fn from_rng(rng: StdRng, len: usize) -> Self {
        Self {
            rng,
            len: len.max(1),
            issued: HashSet::new(),
        }
    }

    /// Produce a name not issued before on this generator.
    ///
    /// If the name space at the current length is nearly exhausted the
    /// suffix grows by one character.
    pub fn next_name(&mut self) -> String {
        let mut collisions = 0u32;
        loop {
            if collisions == 64 {
                self.len += 1;
                collisions = 0;
            }
            let suffix: String = (&mut self.rng)
                .sample_iter(&Alphanumeric)
                .take(self.len)
                .map(char::from)
                .collect();
            let name = format!("{}{}", STATEMENT_NAME_PREFIX, suffix);
            if self.issued.insert(name.clone()) {
                return name;
            }
            collisions += 1;
        }
    }
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_STATEMENT_NAME_LEN)
    }
}
