use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dns_proto::protocol::types::*;

/// A convenience wrapper around a `Cache` which lets it be shared
/// between threads.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

impl SharedCache {
    /// Make a new, empty, shared cache.
    pub fn new() -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(Cache::new())),
        }
    }

    /// Get an entry from the cache.
    ///
    /// The TTL in the returned `ResourceRecord`s is relative to the
    /// current time, not to when the record was inserted. Only
    /// records which have not expired are returned; if every record
    /// for this question has expired (or none were ever cached) this
    /// is a miss.
    pub fn get(&self, name: &DomainName, qtype: &QueryType, qclass: &QueryClass) -> (Vec<ResourceRecord>, bool) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .get(name, qtype, qclass)
    }

    /// Cache the answers to a question, replacing whatever was
    /// previously stored for it.
    ///
    /// Answers with a zero TTL are dropped rather than cached; if
    /// nothing is left afterwards, any existing entry for this
    /// question is left untouched.
    pub fn set(&self, question: &Question, answers: &[ResourceRecord]) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).set(question, answers);
    }

    /// The number of questions currently tracked (expired or not).
    /// Exposed for metrics/logging, not for correctness.
    pub fn len(&self) -> usize {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The key a cache entry is stored and looked up under: a question,
/// lowercase-normalized (domain names are always stored lowercase, see
/// `DomainName::from_labels`).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct QuestionKey {
    name: DomainName,
    qtype: QueryType,
    qclass: QueryClass,
}

/// The records cached for one question, and when each was retrieved.
/// A record is live at time `t` iff `retrieved_at + ttl > t`; this is
/// checked lazily, at `get` time, rather than by any background
/// sweep.
#[derive(Debug, Clone)]
struct CacheEntry {
    answers: Vec<ResourceRecord>,
    retrieved_at: Instant,
}

/// Caching for `ResourceRecord`s, keyed by question.
///
/// This has no eviction: entries accumulate for the lifetime of the
/// process and are never removed, only filtered at read time once
/// expired. That's a deliberate simplification over an LRU/size-bound
/// scheme: the working set here is bounded by the diversity of
/// questions seen over an interval shorter than typical TTLs, not by
/// adversarial cache-filling. You probably want `SharedCache` instead
/// of this directly.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    entries: HashMap<QuestionKey, CacheEntry>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        name: &DomainName,
        qtype: &QueryType,
        qclass: &QueryClass,
    ) -> (Vec<ResourceRecord>, bool) {
        let key = QuestionKey {
            name: name.clone(),
            qtype: *qtype,
            qclass: *qclass,
        };

        let Some(entry) = self.entries.get(&key) else {
            return (Vec::new(), false);
        };

        let now = Instant::now();
        let live = entry
            .answers
            .iter()
            .filter_map(|rr| live_with_adjusted_ttl(rr, entry.retrieved_at, now))
            .collect::<Vec<_>>();

        let hit = !live.is_empty();
        (live, hit)
    }

    pub fn set(&mut self, question: &Question, answers: &[ResourceRecord]) {
        let live: Vec<ResourceRecord> = answers.iter().filter(|rr| rr.ttl > 0).cloned().collect();
        if live.is_empty() {
            return;
        }

        let key = QuestionKey {
            name: question.name.clone(),
            qtype: question.qtype,
            qclass: question.qclass,
        };

        self.entries.insert(
            key,
            CacheEntry {
                answers: live,
                retrieved_at: Instant::now(),
            },
        );
    }
}

/// A record is live iff its TTL hasn't elapsed since it was cached.
/// Returns the record with its TTL adjusted down to the time
/// remaining, or `None` if it has expired.
fn live_with_adjusted_ttl(
    rr: &ResourceRecord,
    retrieved_at: Instant,
    now: Instant,
) -> Option<ResourceRecord> {
    let elapsed = now.saturating_duration_since(retrieved_at);
    let ttl = Duration::from_secs(rr.ttl.into());

    if elapsed >= ttl {
        return None;
    }

    let remaining = (ttl - elapsed).as_secs().try_into().unwrap_or(u32::MAX);
    let mut rr = rr.clone();
    rr.ttl = remaining;
    Some(rr)
}
