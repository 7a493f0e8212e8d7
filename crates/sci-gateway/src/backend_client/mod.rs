//! Backend clients: one adapter per wire dialect, all behind [`BackendClient`].

pub mod alphafold_client;
pub mod chat_client;
pub mod client_trait;
pub mod esm3_client;
pub mod evo2_client;
pub mod field_client;
pub mod http;
pub mod mattergen_client;
pub mod retry;

use std::sync::Arc;

pub use alphafold_client::AlphaFoldClient;
pub use chat_client::ChatClient;
pub use client_trait::{
    BackendClient, BackendDelta, BackendError, BackendPayload, BackendReply, BackendStream, ReplyFinish,
};
pub use esm3_client::Esm3Client;
pub use evo2_client::Evo2Client;
pub use field_client::FieldClient;
pub use mattergen_client::MatterGenClient;
pub use retry::RetryPolicy;

use crate::registry::{BackendDescriptor, Protocol};

/// Build the client matching a descriptor's protocol.
pub fn build_client(descriptor: &BackendDescriptor) -> Arc<dyn BackendClient> {
    match descriptor.protocol {
        Protocol::OpenaiChat => Arc::new(ChatClient::new(descriptor)),
        Protocol::Esm3 => Arc::new(Esm3Client::new(descriptor)),
        Protocol::Alphafold2 => Arc::new(AlphaFoldClient::new(descriptor)),
        Protocol::Evo2 => Arc::new(Evo2Client::new(descriptor)),
        Protocol::Mattergen => Arc::new(MatterGenClient::new(descriptor)),
        Protocol::FieldPredict => Arc::new(FieldClient::new(descriptor)),
    }
}
