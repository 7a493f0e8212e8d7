//! Routing gateway for scientific language models.
//!
//! Requests arrive on an OpenAI-compatible chat endpoint, are classified
//! into a scientific domain, dispatched to the matching specialised backend
//! (with a mandatory fallback to the general model) and assembled back into
//! one chat completion.

pub mod api;
pub mod assembler;
pub mod backend_client;
pub mod classifier;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shared_state;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
mod testing;

// Public API exports
pub use assembler::ResponseAssembler;
pub use classifier::IntentClassifier;
pub use config::Config;
pub use domain::{Domain, DomainIntent, IntentParams};
pub use error::GatewayError;
pub use orchestrator::{DispatchOrchestrator, DispatchOutcome};
pub use protocol::{ChatRequest, ChatResponse, Message};
pub use registry::{BackendDescriptor, CapabilityRegistry, HealthStatus, Protocol};
pub use server::{build_router, run_server};
pub use shared_state::AppState;
