//! Policy backends.
//!
//! - [`tokenizer`] -- byte-level tokenizer with `BOS`/`EOS`.
//! - [`base`] -- frozen bigram base model and its seed corpus.
//! - [`lora`] -- the trainable [`LoraPolicy`] and its frozen [`ReferencePolicy`].
//! - [`generate`] -- the [`Generator`] interface and in-process sampling.
//! - [`api`] -- OpenAI-compatible remote generation client.
//! - [`prompt`] -- the expansion prompt template.

pub mod api;
pub mod base;
pub mod generate;
pub mod lora;
pub mod prompt;
pub mod tokenizer;

pub use api::{ChatMessage, ChatResponse, LlmClient};
pub use base::BigramBase;
pub use generate::{Generator, LocalGenerator};
pub use lora::{CausalLm, LoraPolicy, ReferencePolicy};
pub use tokenizer::ByteTokenizer;
