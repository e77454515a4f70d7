//! Text-generation providers used by the streaming pipeline and title generation.

pub mod factory;
pub mod model;
pub mod providers;

pub use factory::create_provider;
pub use model::{
    ChatMessage, ChatRole, ChunkStream, GenerationConfig, ModelProvider, ModelResponse,
    ProviderKind, ProviderMetadata,
};
pub use providers::MockProvider;
