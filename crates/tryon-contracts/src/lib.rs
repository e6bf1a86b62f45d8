pub mod error;
pub mod events;
pub mod features;
pub mod models;
pub mod prompts;
pub mod runs;
pub mod session;

pub use error::{ErrorClass, ProviderError, ValidationError};
pub use features::{FeatureKind, GenerationOptions};
