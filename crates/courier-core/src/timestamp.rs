//! Lazily formatted, globally invalidatable timestamps.
//!
//! A [`CachedTimestamp`] wraps a unix epoch and formats it on first read
//! using a format string looked up *by key* from a [`FormatProvider`]. The
//! [`TimestampRegistry`] keeps weak handles to every live instance of each
//! [`StampKind`], so a settings change can clear every cached display of
//! that kind in one broadcast without keeping any instance alive.
//!
//! ```text
//! SettingsStore::set_format(Datestamp, "%Y-%m-%d")
//!        │
//!        ▼
//! TimestampRegistry::invalidate(Datestamp)
//!        │  upgrade each Weak, skip the dead ones
//!        ▼
//! every live datestamp drops its cached string; next display() re-renders
//! ```

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{Local, TimeZone};
use serde::{Serialize, Serializer};

/// Display used when a format string is missing or cannot be rendered.
pub const FALLBACK_DISPLAY: &str = "Bad format!";

/// Registries are pruned of dead entries every this many registrations.
const PRUNE_INTERVAL: usize = 64;

/// Display variant of a timestamp; each has its own format key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StampKind {
    /// Full date and time.
    Timestamp,
    /// Date only.
    Datestamp,
}

impl StampKind {
    pub const ALL: [StampKind; 2] = [StampKind::Timestamp, StampKind::Datestamp];

    /// Settings key holding the format string for this kind.
    pub fn format_key(self) -> &'static str {
        match self {
            StampKind::Timestamp => "timestamp_format",
            StampKind::Datestamp => "datestamp_format",
        }
    }
}

/// Source of format strings, queried by key on every render.
pub trait FormatProvider: Send + Sync {
    fn format(&self, key: &str) -> Option<String>;
}

struct StampState {
    value: i64,
    display: Option<String>,
}

struct StampInner {
    kind: StampKind,
    state: Mutex<StampState>,
    provider: Arc<dyn FormatProvider>,
}

impl StampInner {
    fn clear_display(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .display = None;
    }
}

/// An epoch value with a lazily computed display string.
///
/// Create instances through [`TimestampRegistry`] so they take part in
/// format-change broadcasts. Dropping the instance removes it from the
/// broadcast set.
pub struct CachedTimestamp {
    inner: Arc<StampInner>,
}

impl CachedTimestamp {
    pub fn kind(&self) -> StampKind {
        self.inner.kind
    }

    pub fn value(&self) -> i64 {
        self.lock().value
    }

    /// Formatted value. `0` renders as an empty string.
    pub fn display(&self) -> String {
        let mut state = self.lock();
        if let Some(display) = &state.display {
            return display.clone();
        }
        let format = self.inner.provider.format(self.inner.kind.format_key());
        let display = render(state.value, format.as_deref());
        state.display = Some(display.clone());
        display
    }

    /// Replace the epoch (when given) and drop the cached display.
    ///
    /// `update(None)` only forces the next read to re-render.
    pub fn update(&self, value: impl Into<Option<i64>>) {
        let mut state = self.lock();
        if let Some(value) = value.into() {
            state.value = value;
        }
        state.display = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StampState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CachedTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedTimestamp")
            .field("kind", &self.inner.kind)
            .field("value", &self.value())
            .finish()
    }
}

impl Serialize for CachedTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.value())
    }
}

fn render(value: i64, format: Option<&str>) -> String {
    if value == 0 {
        return String::new();
    }
    let Some(format) = format else {
        return FALLBACK_DISPLAY.to_string();
    };
    let Some(time) = Local.timestamp_opt(value, 0).single() else {
        return FALLBACK_DISPLAY.to_string();
    };
    // chrono reports bad specifiers as a fmt::Error while writing.
    let mut out = String::new();
    if write!(out, "{}", time.format(format)).is_err() {
        return FALLBACK_DISPLAY.to_string();
    }
    out
}

/// Process-scoped weak registry of live timestamps, one set per kind.
///
/// Empty on construction; [`TimestampRegistry::clear`] empties it at
/// shutdown.
pub struct TimestampRegistry {
    provider: Arc<dyn FormatProvider>,
    live: Mutex<HashMap<StampKind, Vec<Weak<StampInner>>>>,
}

impl TimestampRegistry {
    pub fn new(provider: Arc<dyn FormatProvider>) -> Self {
        Self {
            provider,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a timestamp of the given kind.
    pub fn create(&self, kind: StampKind, value: i64) -> CachedTimestamp {
        let inner = Arc::new(StampInner {
            kind,
            state: Mutex::new(StampState {
                value,
                display: None,
            }),
            provider: Arc::clone(&self.provider),
        });

        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = live.entry(kind).or_default();
        entries.push(Arc::downgrade(&inner));
        if entries.len() % PRUNE_INTERVAL == 0 {
            entries.retain(|entry| entry.strong_count() > 0);
        }

        CachedTimestamp { inner }
    }

    pub fn timestamp(&self, value: i64) -> CachedTimestamp {
        self.create(StampKind::Timestamp, value)
    }

    pub fn datestamp(&self, value: i64) -> CachedTimestamp {
        self.create(StampKind::Datestamp, value)
    }

    /// Clear the cached display of every live instance of `kind`.
    ///
    /// Dead entries are skipped and pruned. Returns how many live instances
    /// were invalidated.
    pub fn invalidate(&self, kind: StampKind) -> usize {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = live.get_mut(&kind) else {
            return 0;
        };
        let mut refreshed = 0;
        entries.retain(|entry| match entry.upgrade() {
            Some(inner) => {
                inner.clear_display();
                refreshed += 1;
                true
            }
            None => false,
        });
        log::debug!("invalidated {refreshed} cached {kind:?} displays");
        refreshed
    }

    /// Number of registered instances of `kind` that are still alive.
    pub fn live_count(&self, kind: StampKind) -> usize {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        live.get(&kind)
            .map(|entries| entries.iter().filter(|e| e.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Forget every registered instance. Instances keep working but no
    /// longer receive broadcasts.
    pub fn clear(&self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 2023-11-14 in every timezone
    const NOV_2023: i64 = 1_700_000_000;
    // 2001-09-09 in every timezone
    const SEP_2001: i64 = 1_000_000_000;

    #[derive(Default)]
    struct FakeFormats {
        formats: Mutex<HashMap<String, String>>,
        lookups: AtomicUsize,
    }

    impl FakeFormats {
        fn with(timestamp: &str, datestamp: &str) -> Arc<Self> {
            let fake = Self::default();
            fake.set(StampKind::Timestamp, timestamp);
            fake.set(StampKind::Datestamp, datestamp);
            Arc::new(fake)
        }

        fn set(&self, kind: StampKind, format: &str) {
            self.formats
                .lock()
                .unwrap()
                .insert(kind.format_key().to_string(), format.to_string());
        }
    }

    impl FormatProvider for FakeFormats {
        fn format(&self, key: &str) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.formats.lock().unwrap().get(key).cloned()
        }
    }

    mod display {
        use super::*;

        #[test]
        fn zero_is_empty() {
            let registry = TimestampRegistry::new(FakeFormats::with("%Y", "%Y"));
            assert_eq!(registry.timestamp(0).display(), "");
        }

        #[test]
        fn formats_with_looked_up_key() {
            let registry = TimestampRegistry::new(FakeFormats::with("year %Y", "%Y"));
            assert_eq!(registry.timestamp(NOV_2023).display(), "year 2023");
        }

        #[test]
        fn bad_format_falls_back() {
            let registry = TimestampRegistry::new(FakeFormats::with("%Q oops", "%Y"));
            assert_eq!(registry.timestamp(NOV_2023).display(), FALLBACK_DISPLAY);
        }

        #[test]
        fn missing_format_falls_back() {
            let registry = TimestampRegistry::new(Arc::new(FakeFormats::default()));
            assert_eq!(registry.datestamp(NOV_2023).display(), FALLBACK_DISPLAY);
        }

        #[test]
        fn display_is_cached() {
            let formats = FakeFormats::with("%Y", "%Y");
            let registry = TimestampRegistry::new(formats.clone());
            let stamp = registry.timestamp(NOV_2023);
            stamp.display();
            stamp.display();
            assert_eq!(formats.lookups.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn update_replaces_value_and_clears_cache() {
            let registry = TimestampRegistry::new(FakeFormats::with("%Y", "%Y"));
            let stamp = registry.timestamp(NOV_2023);
            assert_eq!(stamp.display(), "2023");
            stamp.update(SEP_2001);
            assert_eq!(stamp.value(), SEP_2001);
            assert_eq!(stamp.display(), "2001");
        }

        #[test]
        fn update_none_only_invalidates() {
            let formats = FakeFormats::with("%Y", "%Y");
            let registry = TimestampRegistry::new(formats.clone());
            let stamp = registry.timestamp(NOV_2023);
            assert_eq!(stamp.display(), "2023");
            formats.set(StampKind::Timestamp, "[%Y]");
            assert_eq!(stamp.display(), "2023");
            stamp.update(None);
            assert_eq!(stamp.value(), NOV_2023);
            assert_eq!(stamp.display(), "[2023]");
        }

        #[test]
        fn serializes_as_epoch() {
            let registry = TimestampRegistry::new(FakeFormats::with("%Y", "%Y"));
            let json = serde_json::to_string(&registry.datestamp(NOV_2023)).unwrap();
            assert_eq!(json, "1700000000");
        }
    }

    mod registry {
        use super::*;

        #[test]
        fn broadcast_refreshes_live_instances_of_kind() {
            let formats = FakeFormats::with("%Y", "%Y");
            let registry = TimestampRegistry::new(formats.clone());
            let stamps: Vec<_> = (0..3).map(|_| registry.timestamp(NOV_2023)).collect();
            let date = registry.datestamp(NOV_2023);
            for stamp in &stamps {
                assert_eq!(stamp.display(), "2023");
            }
            assert_eq!(date.display(), "2023");

            formats.set(StampKind::Timestamp, "<%Y>");
            formats.set(StampKind::Datestamp, "(%Y)");
            assert_eq!(registry.invalidate(StampKind::Timestamp), 3);

            for stamp in &stamps {
                assert_eq!(stamp.display(), "<2023>");
            }
            // Other kind keeps its cache until its own broadcast.
            assert_eq!(date.display(), "2023");
            registry.invalidate(StampKind::Datestamp);
            assert_eq!(date.display(), "(2023)");
        }

        #[test]
        fn dropped_instances_are_skipped() {
            let registry = TimestampRegistry::new(FakeFormats::with("%Y", "%Y"));
            let keep = registry.timestamp(NOV_2023);
            let gone = registry.timestamp(NOV_2023);
            drop(gone);
            assert_eq!(registry.live_count(StampKind::Timestamp), 1);
            assert_eq!(registry.invalidate(StampKind::Timestamp), 1);
            assert_eq!(keep.display(), "2023");
        }

        #[test]
        fn invalidate_unknown_kind_is_noop() {
            let registry = TimestampRegistry::new(FakeFormats::with("%Y", "%Y"));
            assert_eq!(registry.invalidate(StampKind::Datestamp), 0);
        }

        #[test]
        fn registry_does_not_extend_lifetime() {
            let registry = TimestampRegistry::new(FakeFormats::with("%Y", "%Y"));
            for _ in 0..(PRUNE_INTERVAL * 2) {
                registry.timestamp(NOV_2023);
            }
            assert_eq!(registry.live_count(StampKind::Timestamp), 0);
            assert_eq!(registry.invalidate(StampKind::Timestamp), 0);
        }

        #[test]
        fn clear_stops_broadcasts() {
            let formats = FakeFormats::with("%Y", "%Y");
            let registry = TimestampRegistry::new(formats.clone());
            let stamp = registry.timestamp(NOV_2023);
            assert_eq!(stamp.display(), "2023");
            registry.clear();
            formats.set(StampKind::Timestamp, "<%Y>");
            assert_eq!(registry.invalidate(StampKind::Timestamp), 0);
            assert_eq!(stamp.display(), "2023");
        }

        #[test]
        fn broadcast_from_other_thread() {
            let formats = FakeFormats::with("%Y", "%Y");
            let registry = Arc::new(TimestampRegistry::new(formats.clone()));
            let stamp = registry.timestamp(NOV_2023);
            assert_eq!(stamp.display(), "2023");
            formats.set(StampKind::Timestamp, "<%Y>");
            let remote = Arc::clone(&registry);
            std::thread::spawn(move || remote.invalidate(StampKind::Timestamp))
                .join()
                .unwrap();
            assert_eq!(stamp.display(), "<2023>");
        }
    }
}
