//! Thin interfaces to the system's external collaborators (C8, §6, §10.5):
//! the refresh-token store, the inspection-metrics sink, and the upstream
//! directory lookup. Grounded on `original_source/db.go` and `metrics.go`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Persists refresh tokens across bot reconnects.
pub trait TokenStore: Send + Sync {
    fn get(&self, bot_name: &str) -> Option<String>;
    fn set(&self, bot_name: &str, token: Option<String>);
}

/// In-memory stand-in for a real persistence layer, matching the Go
/// source's `StubDB`.
#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl TokenStore for InMemoryTokenStore {
    fn get(&self, bot_name: &str) -> Option<String> {
        self.tokens.lock().unwrap().get(bot_name).cloned()
    }

    fn set(&self, bot_name: &str, token: Option<String>) {
        let mut tokens = self.tokens.lock().unwrap();
        match token {
            Some(token) => {
                tokens.insert(bot_name.to_string(), token);
            }
            None => {
                tokens.remove(bot_name);
            }
        }
    }
}

/// Records one correlated inspection response per call.
pub trait MetricsSink: Send + Sync {
    fn log_lookup(&self, bot_name: &str, latency: Duration, fired_at: Instant, is_error: bool);
}

/// No-op metrics sink, matching the Go source's `StubMetrics`.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn log_lookup(&self, _bot_name: &str, _latency: Duration, _fired_at: Instant, _is_error: bool) {}
}

/// Resolves candidate session-manager endpoints ("CMs"), standing in for
/// `steam.GetRandomCM()` / `steam.InitializeSteamDirectory()`.
pub trait DirectoryLookup: Send + Sync {
    /// Refreshes the directory. Called once at startup and then on a
    /// recurring timer (§11).
    fn refresh(&self);

    /// Returns one candidate endpoint to dial.
    fn pick(&self) -> String;
}

/// Fixed round-robin directory — enough to run the gateway standalone
/// without a real upstream directory service.
pub struct StaticDirectory {
    endpoints: Vec<String>,
    cursor: std::sync::atomic::AtomicUsize,
}

impl StaticDirectory {
    pub fn new(endpoints: Vec<String>) -> StaticDirectory {
        StaticDirectory {
            endpoints,
            cursor: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl DirectoryLookup for StaticDirectory {
    fn refresh(&self) {
        // Nothing to refresh — the list is fixed at construction time.
    }

    fn pick(&self) -> String {
        if self.endpoints.is_empty() {
            return String::new();
        }
        let index = self
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.endpoints.len();
        self.endpoints[index].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_token_store_roundtrips() {
        let store = InMemoryTokenStore::default();
        assert_eq!(store.get("bot1"), None);
        store.set("bot1", Some("tok".to_string()));
        assert_eq!(store.get("bot1"), Some("tok".to_string()));
        store.set("bot1", None);
        assert_eq!(store.get("bot1"), None);
    }

    #[test]
    fn static_directory_round_robins() {
        let dir = StaticDirectory::new(vec!["a:1".into(), "b:2".into()]);
        assert_eq!(dir.pick(), "a:1");
        assert_eq!(dir.pick(), "b:2");
        assert_eq!(dir.pick(), "a:1");
    }

    #[test]
    fn static_directory_empty_returns_empty_string() {
        let dir = StaticDirectory::new(vec![]);
        assert_eq!(dir.pick(), "");
    }
}
