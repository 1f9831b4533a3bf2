use crate::config::PolicyConfig;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use url::Url;

const WINDOW: Duration = Duration::from_secs(3600);

/// Sliding-window action tracker for rate limiting.
#[derive(Debug, Default)]
pub struct ActionTracker {
    /// Timestamps of recent actions (kept within the last hour).
    actions: Mutex<Vec<Instant>>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(actions: &mut Vec<Instant>) {
        let cutoff = Instant::now().checked_sub(WINDOW).unwrap_or_else(Instant::now);
        actions.retain(|t| *t > cutoff);
    }

    /// Record an action and return the current count within the window.
    pub fn record(&self) -> usize {
        let mut actions = self.actions.lock();
        Self::prune(&mut actions);
        actions.push(Instant::now());
        actions.len()
    }

    /// Count of actions in the current window without recording.
    pub fn count(&self) -> usize {
        let mut actions = self.actions.lock();
        Self::prune(&mut actions);
        actions.len()
    }
}

impl Clone for ActionTracker {
    fn clone(&self) -> Self {
        Self {
            actions: Mutex::new(self.actions.lock().clone()),
        }
    }
}

/// Guard rails applied to every browser action a plan performs.
#[derive(Debug, Clone)]
pub struct ActionPolicy {
    /// Lower-cased hosts. Empty allows every host.
    pub allowed_domains: Vec<String>,
    pub max_actions_per_hour: u32,
    pub tracker: ActionTracker,
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

impl ActionPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|d| d.trim().trim_start_matches("*.").trim_end_matches('.').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            max_actions_per_hour: config.max_actions_per_hour,
            tracker: ActionTracker::new(),
        }
    }

    /// Whether a navigate step may open `url`.
    ///
    /// Only `http`/`https` (and `about:blank`) are accepted. With a
    /// non-empty allowlist the host must equal an entry or be a subdomain
    /// of one.
    pub fn is_url_allowed(&self, url: &str) -> bool {
        let url = url.trim();
        if url.eq_ignore_ascii_case("about:blank") {
            return true;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.trim_end_matches('.').to_lowercase();
        self.allowed_domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Explain why `url` is rejected, `None` when it is allowed.
    pub fn check_url(&self, url: &str) -> Option<String> {
        (!self.is_url_allowed(url)).then(|| {
            if self.allowed_domains.is_empty() {
                format!("URL '{url}' is not an http(s) address")
            } else {
                format!(
                    "URL '{url}' is outside the allowed domains: {}",
                    self.allowed_domains.join(", ")
                )
            }
        })
    }

    /// Record an action and check if the rate limit has been exceeded.
    /// Returns `true` if the action is allowed, `false` if rate-limited.
    pub fn record_action(&self) -> bool {
        let count = self.tracker.record();
        count <= self.max_actions_per_hour as usize
    }

    /// Check if the rate limit would be exceeded without recording.
    pub fn is_rate_limited(&self) -> bool {
        self.tracker.count() >= self.max_actions_per_hour as usize
    }
}
