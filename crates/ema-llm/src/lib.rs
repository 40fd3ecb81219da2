//! LLM client implementations for the EMA runtime.
//!
//! The real provider adapters live behind the `LlmClient` contract and
//! are out of scope here; this crate ships the retry wrapper every
//! deployment uses, the deterministic mock that powers the test suite,
//! and the no-auth stand-in the binary falls back to.

pub mod mock;
pub mod noauth;
pub mod retry;

pub use mock::{MockClient, MockReply};
pub use noauth::NoAuthClient;
pub use retry::{RetryClient, RetryConfig};
