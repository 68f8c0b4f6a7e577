use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

/// Release callback stored in a Ledger entry
type Release = Box<dyn FnOnce() + Send>;

/// LedgerKey identifies a single entry so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerKey(u64);

struct Entry {
    key: LedgerKey,
    label: String,
    release: Release,
}

#[derive(Default)]
struct Inner {
    next_key: u64,
    entries: Vec<Entry>,
}

/// Ledger is an ordered list of release callbacks scoped to one execution
/// context: the supervisor owns one, every relayed connection owns its own.
///
/// Entries run most-recently-added first. Cloning the ledger hands out another
/// handle to the same list, so a callback may push or remove entries while
/// `run_all` is draining it.
#[derive(Clone, Default)]
pub struct Ledger {
    inner: Arc<Mutex<Inner>>,
}

/// Ledger implementation block
impl Ledger {
    /// new is a constructor for an empty Ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A callback never runs while the lock is held, so a poisoned lock
        // still holds a consistent list
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// push records a release callback and returns its key
    pub fn push<F>(&self, label: impl Into<String>, release: F) -> LedgerKey
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        let key = LedgerKey(inner.next_key);
        inner.next_key += 1;
        inner.entries.push(Entry {
            key,
            label: label.into(),
            release: Box::new(release),
        });
        key
    }

    /// remove drops an entry without running it. Returns false when the key
    /// is not (or no longer) present
    pub fn remove(&self, key: LedgerKey) -> bool {
        let mut inner = self.lock();
        match inner.entries.iter().position(|e| e.key == key) {
            Some(idx) => {
                inner.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// len returns the number of pending entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// is_empty reports whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// run_all pops and runs every entry, newest first, until the ledger is
    /// empty. Entries added by a running callback are run in the same pass
    pub fn run_all(&self) {
        loop {
            // Pop under the lock, run outside of it
            let entry = self.lock().entries.pop();
            let Some(entry) = entry else {
                break;
            };

            trace!("releasing {}", entry.label);
            (entry.release)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, Ledger) {
        (Arc::new(Mutex::new(Vec::new())), Ledger::new())
    }

    #[test]
    fn runs_newest_first() {
        let (log, ledger) = recorder();
        for name in ["listener", "pidfile", "relay"] {
            let log = Arc::clone(&log);
            ledger.push(name, move || log.lock().unwrap().push(name));
        }

        ledger.run_all();

        assert_eq!(*log.lock().unwrap(), vec!["relay", "pidfile", "listener"]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn removed_entries_never_run() {
        let (log, ledger) = recorder();
        let first = {
            let log = Arc::clone(&log);
            ledger.push("first", move || log.lock().unwrap().push("first"))
        };
        {
            let log = Arc::clone(&log);
            ledger.push("second", move || log.lock().unwrap().push("second"));
        }

        assert!(ledger.remove(first));
        assert!(!ledger.remove(first));
        assert_eq!(ledger.len(), 1);

        ledger.run_all();
        assert_eq!(*log.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn callbacks_may_add_entries_while_running() {
        let (log, ledger) = recorder();
        let handle = ledger.clone();
        let inner_log = Arc::clone(&log);
        ledger.push("outer", move || {
            inner_log.lock().unwrap().push("outer");
            let log = Arc::clone(&inner_log);
            handle.push("late", move || log.lock().unwrap().push("late"));
        });

        ledger.run_all();

        assert_eq!(*log.lock().unwrap(), vec!["outer", "late"]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn callbacks_may_remove_entries_while_running() {
        let (log, ledger) = recorder();
        let victim = {
            let log = Arc::clone(&log);
            ledger.push("victim", move || log.lock().unwrap().push("victim"))
        };
        let handle = ledger.clone();
        ledger.push("remover", move || {
            handle.remove(victim);
        });

        ledger.run_all();

        assert!(log.lock().unwrap().is_empty());
    }
}
