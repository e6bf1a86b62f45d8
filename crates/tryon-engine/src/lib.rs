pub mod codec;
pub mod config;
pub mod geometry;
pub mod orchestrator;
pub mod providers;

pub use codec::{ImageAsset, ImageError};
pub use config::EngineConfig;
pub use orchestrator::{GenerationError, GenerationRequest, GenerationResult, Orchestrator};
pub use providers::{ImageProvider, ImageProviderRegistry};
