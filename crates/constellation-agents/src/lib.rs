pub mod catalog;
pub mod gateway;
pub mod prompt;
pub mod providers;
pub mod relay;

pub use catalog::{ModelOption, default_model, direct_models_for, models_for, resolve_model};
pub use gateway::{Backend, ProviderGateway, RetryPolicy, Route};
pub use prompt::{build_system_prompt, combine_context, with_continuity};
pub use providers::{
    AnthropicProvider, ChatMessage, ChatRole, LlmProvider, LlmRequest, LlmResponse,
    OpenAiProvider, Usage,
};
pub use relay::{RelayEngine, RelayStatus};
