pub mod filter;
pub mod gemini;
pub mod llm_error;
pub mod prompt;

pub use filter::{apply as apply_filters, parse_filter_reply, FilterCondition, FilterOp, FilterParseError};
pub use gemini::{Completion, CompletionService, GeminiClient};
pub use llm_error::LlmError;
pub use prompt::PromptBuilder;
