pub mod image_quality;
pub mod middleware;
pub mod moderation;
pub mod pattern_gate;
pub mod rate_limiter;
pub mod reputation;

pub use image_quality::ImageQualityGate;
pub use moderation::{ModerationPipeline, TopicProfile};
pub use pattern_gate::PatternGate;
pub use rate_limiter::{RateLimitPolicy, RateLimiter};
pub use reputation::ReputationStore;
