//! HTTP boundary for the EMA runtime.
//!
//! Two contracts live here: input submission (`POST /input`, response
//! is acknowledgement only) and the one-way SSE event stream
//! (`GET /events`) that relays `{kind, content}` envelopes with actor
//! attribution. A registry owns one worker per (user, actor).

pub mod http;
pub mod registry;
pub mod relay;

pub use http::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use registry::WorkerRegistry;
pub use relay::OutboundEvent;
