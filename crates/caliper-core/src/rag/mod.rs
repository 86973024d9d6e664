//! Retrieval-augmented answering over the evidence index.

pub mod answer;
pub mod guards;
pub mod index;
pub mod prompts;
pub mod provider;
pub mod retrieve;
pub mod tokenizer;

pub use answer::{ask, ask_stream, Answer, Citation};
pub use index::{rebuild_index, IndexStats};
pub use provider::{OllamaProvider, Provider, ProviderOptions};
pub use retrieve::{retrieve, Retrieval, RetrievalMode, RetrievalScope, RetrievedDoc};
