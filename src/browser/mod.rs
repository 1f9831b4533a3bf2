pub mod http;
pub mod keys;
pub mod traits;

pub use http::HttpBrowserClient;
pub use keys::normalize_key_combo;
pub use traits::{
    ActionOutcome, BrowserAction, BrowserToolClient, ElementQuery, ElementRect, ScrollDirection,
    Screenshot, SessionInfo,
};
