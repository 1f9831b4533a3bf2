use crate::coords::Space;
use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the file was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default = "VisionConfig::default_a")]
    pub vision_a: VisionConfig,
    #[serde(default = "VisionConfig::default_b")]
    pub vision_b: VisionConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub loop_detector: LoopDetectorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        Self {
            config_path: home.join(".browser-pilot").join("config.toml"),
            log_level: default_log_level(),
            browser: BrowserConfig::default(),
            vision_a: VisionConfig::default_a(),
            vision_b: VisionConfig::default_b(),
            resolver: ResolverConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            loop_detector: LoopDetectorConfig::default(),
            cache: CacheConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

// ── Remote automation service ─────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_browser_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_browser_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_browser_endpoint() -> String {
    "http://127.0.0.1:8787/v1".into()
}

fn default_browser_timeout_ms() -> u64 {
    30_000
}

impl std::fmt::Debug for BrowserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserConfig")
            .field("endpoint", &self.endpoint)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: default_browser_endpoint(),
            api_key: None,
            timeout_ms: default_browser_timeout_ms(),
        }
    }
}

// ── Vision locator services ───────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Service URL. `None` disables the source.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Coordinate space the service answers in.
    pub native_space: Space,
    #[serde(default)]
    pub model: Option<String>,
}

impl VisionConfig {
    fn default_a() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            native_space: Space::Normalized,
            model: None,
        }
    }

    fn default_b() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            native_space: Space::VendorSdk,
            model: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty())
    }
}

impl std::fmt::Debug for VisionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionConfig")
            .field("endpoint", &self.endpoint)
            .field("native_space", &self.native_space)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

// ── Triple verification ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub dom_timeout_ms: u64,
    pub vision_timeout_ms: u64,
    /// Sources within this distance agree.
    pub match_px: f64,
    /// Upper edge of the first warning band.
    pub warn_px: f64,
    /// Beyond this the DOM is treated as pointing somewhere else.
    pub far_px: f64,
    /// Screenshots larger than this are not sent to vision services.
    pub max_image_bytes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dom_timeout_ms: 5_000,
            vision_timeout_ms: 30_000,
            match_px: 50.0,
            warn_px: 100.0,
            far_px: 150.0,
            max_image_bytes: 6_291_456,
        }
    }
}

// ── Orchestrator ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Attempts per spatial step (attempt 0 plus retries).
    pub max_retries: u32,
    /// Steps beyond this index fail the run.
    pub max_steps: usize,
    pub retry_delay_ms: u64,
    /// Pause after each applied action so the page can settle.
    pub settle_delay_ms: u64,
    pub default_wait_ms: u64,
    pub use_cache: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_steps: 50,
            retry_delay_ms: 1_000,
            settle_delay_ms: 500,
            default_wait_ms: 1_000,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectorConfig {
    pub history: usize,
    pub threshold: usize,
    pub failure_window: usize,
    pub coordinate_tolerance_px: f64,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            history: 50,
            threshold: 3,
            failure_window: 10,
            coordinate_tolerance_px: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    pub min_successes: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            ttl_secs: 3_600,
            min_successes: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Domains navigate steps may open. Empty allows all.
    pub allowed_domains: Vec<String>,
    pub max_actions_per_hour: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            max_actions_per_hour: 1_000,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load from `path`, or from `~/.browser-pilot/config.toml` when `None`.
    /// A missing file yields defaults. Environment overrides apply last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let default_path = Self::default().config_path;
        let config_path = path.map_or(default_path, Path::to_path_buf);

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?
        } else {
            tracing::debug!("No config at {}; using defaults", config_path.display());
            Config::default()
        };
        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        std::fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply `BROWSER_PILOT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = get("BROWSER_PILOT_ENDPOINT") {
            self.browser.endpoint = endpoint;
        }
        if let Some(key) = get("BROWSER_PILOT_API_KEY") {
            self.browser.api_key = Some(key);
        }
        if let Some(url) = get("BROWSER_PILOT_VISION_A_URL") {
            self.vision_a.endpoint = Some(url);
        }
        if let Some(key) = get("BROWSER_PILOT_VISION_A_KEY") {
            self.vision_a.api_key = Some(key);
        }
        if let Some(url) = get("BROWSER_PILOT_VISION_B_URL") {
            self.vision_b.endpoint = Some(url);
        }
        if let Some(key) = get("BROWSER_PILOT_VISION_B_KEY") {
            self.vision_b.api_key = Some(key);
        }
        if let Some(level) = get("BROWSER_PILOT_LOG") {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_endpoint("browser.endpoint", &self.browser.endpoint)?;
        for (name, vision) in [("vision_a", &self.vision_a), ("vision_b", &self.vision_b)] {
            if let Some(endpoint) = vision.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
                validate_endpoint(&format!("{name}.endpoint"), endpoint)?;
            }
        }

        if self.browser.timeout_ms == 0 {
            anyhow::bail!("browser.timeout_ms must be > 0");
        }
        if self.resolver.dom_timeout_ms == 0 || self.resolver.vision_timeout_ms == 0 {
            anyhow::bail!("resolver timeouts must be > 0");
        }
        let r = &self.resolver;
        if !(r.match_px > 0.0 && r.match_px <= r.warn_px && r.warn_px <= r.far_px) {
            anyhow::bail!(
                "resolver thresholds must satisfy 0 < match_px <= warn_px <= far_px (got {}, {}, {})",
                r.match_px,
                r.warn_px,
                r.far_px
            );
        }
        if self.orchestrator.max_retries == 0 {
            anyhow::bail!("orchestrator.max_retries must be >= 1");
        }
        if self.orchestrator.max_steps == 0 {
            anyhow::bail!("orchestrator.max_steps must be >= 1");
        }
        if self.loop_detector.threshold < 2 {
            anyhow::bail!("loop_detector.threshold must be >= 2");
        }
        if self.loop_detector.history < self.loop_detector.threshold {
            anyhow::bail!("loop_detector.history must be >= loop_detector.threshold");
        }
        if self.cache.capacity == 0 {
            anyhow::bail!("cache.capacity must be >= 1");
        }
        Ok(())
    }
}

fn validate_endpoint(key: &str, endpoint: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(endpoint.trim())
        .map_err(|_| anyhow::anyhow!("Invalid {key}: '{endpoint}'. Expected http(s) URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("{key} must use http:// or https://");
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("{key} must include host");
    }
    Ok(())
}
