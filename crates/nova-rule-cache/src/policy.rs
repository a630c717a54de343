use crate::hash::ContentHash;
use std::time::Duration;

/// What a [`ValidityPolicy`] gets to see about a cached entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo<'a> {
    pub key: &'a ContentHash,
    /// Milliseconds since the unix epoch when the entry was written.
    pub timestamp: i64,
    /// Time since `timestamp`; zero for entries from the future.
    pub age: Duration,
}

impl<'a> EntryInfo<'a> {
    pub fn new(key: &'a ContentHash, timestamp: i64, now_millis: i64) -> Self {
        let age = u64::try_from(now_millis.saturating_sub(timestamp)).unwrap_or(0);
        Self {
            key,
            timestamp,
            age: Duration::from_millis(age),
        }
    }
}

/// Externally configured decision on whether a cached entry may be reused.
///
/// Only consulted on a hit; implicit inputs are revalidated separately.
pub trait ValidityPolicy {
    fn is_valid(&self, entry: &EntryInfo<'_>) -> bool;
}

impl<F> ValidityPolicy for F
where
    F: Fn(&EntryInfo<'_>) -> bool,
{
    fn is_valid(&self, entry: &EntryInfo<'_>) -> bool {
        self(entry)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysValid;

impl ValidityPolicy for AlwaysValid {
    fn is_valid(&self, _entry: &EntryInfo<'_>) -> bool {
        true
    }
}

/// Rejects everything when `refresh` is set, and entries older than
/// `max_age` otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub refresh: bool,
    pub max_age: Option<Duration>,
}

impl ValidityPolicy for ExpiryPolicy {
    fn is_valid(&self, entry: &EntryInfo<'_>) -> bool {
        if self.refresh {
            return false;
        }
        match self.max_age {
            Some(max_age) => entry.age <= max_age,
            None => true,
        }
    }
}
