pub mod schema;

pub use schema::{
    BrowserConfig, CacheConfig, Config, LoopDetectorConfig, OrchestratorConfig, PolicyConfig,
    ResolverConfig, VisionConfig,
};
