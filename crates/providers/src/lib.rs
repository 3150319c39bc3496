//! LLM provider adapters.
//!
//! The rest of the system talks to [`LlmProvider`]; the concrete adapter
//! translates between the internal message/tool model and the provider's
//! wire format. Ships with an Anthropic Messages API adapter.

pub mod anthropic;
pub mod sse;
pub mod traits;
pub mod util;

pub use anthropic::AnthropicProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
