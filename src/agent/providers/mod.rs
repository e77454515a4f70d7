pub mod mock;

#[cfg(feature = "openai")]
pub mod openai;

pub use mock::MockProvider;

#[cfg(feature = "openai")]
pub use openai::OpenAIProvider;
