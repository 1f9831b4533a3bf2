pub mod resolver;
pub mod traits;
pub mod vision;

pub use resolver::{
    classify, CoordinateResolver, ResolveRequest, SourceDistances, Thresholds,
    VerificationOutcome, VerificationPattern,
};
pub use traits::{Location, LocatorResult, LocatorSource, VisionHit, VisionLocator, VisionQuery};
pub use vision::HttpVisionLocator;
