//! Deterministic multi-key lock manager.
//!
//! A power-of-two table of `RwLock<()>` stripes keyed by the same
//! FNV-1a hash as the data dict. Acquiring locks for a command (or a
//! whole transaction) collects the stripe indices of every write and
//! read key, dedups them, sorts them in descending order, and takes
//! each stripe's write lock when at least one write key maps to it,
//! its read lock otherwise. Any total order would do as long as every
//! caller uses the same one; descending matches the rest of the
//! codebase's history.
//!
//! Readers never upgrade to writers. Guards are released when the
//! returned [`LockSet`] drops; the stripes are independent, so release
//! order is irrelevant.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::dict::{fnv1a32, shard_count_for};

/// The stripe table. One per database.
pub struct LockMap {
    stripes: Box<[RwLock<()>]>,
    mask: u32,
}

enum StripeGuard<'a> {
    Read(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Write(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Held locks for one command or transaction. Dropping releases all.
pub struct LockSet<'a> {
    guards: Vec<StripeGuard<'a>>,
}

impl LockMap {
    /// Creates a stripe table with `hint` rounded up to a power of two.
    pub fn new(hint: usize) -> Self {
        let n = shard_count_for(hint);
        let stripes = (0..n)
            .map(|_| RwLock::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            stripes,
            mask: (n - 1) as u32,
        }
    }

    fn stripe_of(&self, key: &str) -> u32 {
        fnv1a32(key) & self.mask
    }

    /// Acquires stripes for the given key sets and returns a guard
    /// object holding them. Blocks until every stripe is available.
    pub fn lock<'a, W, R>(&'a self, write_keys: &[W], read_keys: &[R]) -> LockSet<'a>
    where
        W: AsRef<str>,
        R: AsRef<str>,
    {
        let mut write_stripes = BTreeSet::new();
        for key in write_keys {
            write_stripes.insert(self.stripe_of(key.as_ref()));
        }
        let mut all_stripes = write_stripes.clone();
        for key in read_keys {
            all_stripes.insert(self.stripe_of(key.as_ref()));
        }

        // descending order, identical at every call site, keeps
        // concurrent multi-key commands deadlock-free
        let mut guards = Vec::with_capacity(all_stripes.len());
        for &index in all_stripes.iter().rev() {
            let stripe = &self.stripes[index as usize];
            if write_stripes.contains(&index) {
                guards.push(StripeGuard::Write(
                    stripe.write().unwrap_or_else(PoisonError::into_inner),
                ));
            } else {
                guards.push(StripeGuard::Read(
                    stripe.read().unwrap_or_else(PoisonError::into_inner),
                ));
            }
        }
        LockSet { guards }
    }
}

impl LockSet<'_> {
    /// Number of stripes held. Exposed for tests and diagnostics.
    pub fn held(&self) -> usize {
        self.guards.len()
    }
}
