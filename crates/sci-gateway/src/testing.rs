//! Scripted backend used by unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend_client::{
    BackendClient, BackendDelta, BackendError, BackendPayload, BackendReply, BackendStream, ReplyFinish,
};
use crate::protocol::Usage;
use crate::registry::Protocol;

#[derive(Debug, Clone)]
pub enum Behaviour {
    Reply(BackendReply),
    Fail(BackendError),
    /// Sleep before replying; used to trip timeouts and observe concurrency.
    Slow(Duration, BackendReply),
    /// Stream these increments, then optionally fail.
    Stream(Vec<String>, Option<BackendError>),
}

pub struct ScriptedClient {
    id: String,
    protocol: Protocol,
    behaviour: Mutex<Behaviour>,
    probe_ok: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    payloads: Mutex<Vec<BackendPayload>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedClient {
    pub fn new(id: &str, protocol: Protocol, behaviour: Behaviour) -> Self {
        Self {
            id: id.to_string(),
            protocol,
            behaviour: Mutex::new(behaviour),
            probe_ok: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(id: &str, protocol: Protocol, content: &str) -> Self {
        Self::new(id, protocol, Behaviour::Reply(BackendReply::text(content)))
    }

    pub fn failing(id: &str, protocol: Protocol, error: BackendError) -> Self {
        Self::new(id, protocol, Behaviour::Fail(error))
    }

    pub fn slow(id: &str, protocol: Protocol, delay: Duration, content: &str) -> Self {
        Self::new(id, protocol, Behaviour::Slow(delay, BackendReply::text(content)))
    }

    pub fn streaming(id: &str, protocol: Protocol, pieces: &[&str], error: Option<BackendError>) -> Self {
        Self::new(
            id,
            protocol,
            Behaviour::Stream(pieces.iter().map(|p| p.to_string()).collect(), error),
        )
    }

    pub fn with_usage(self, usage: Usage) -> Self {
        if let Ok(mut behaviour) = self.behaviour.lock() {
            if let Behaviour::Reply(reply) | Behaviour::Slow(_, reply) = &mut *behaviour {
                reply.usage = Some(usage);
            }
        }
        self
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<BackendPayload> {
        self.payloads.lock().unwrap().clone()
    }

    fn enter(&self, payload: &BackendPayload) -> (InFlight<'_>, Behaviour) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        (InFlight(&self.in_flight), self.behaviour.lock().unwrap().clone())
    }
}

#[async_trait]
impl BackendClient for ScriptedClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn invoke(&self, payload: &BackendPayload) -> Result<BackendReply, BackendError> {
        let (_guard, behaviour) = self.enter(payload);
        match behaviour {
            Behaviour::Reply(reply) => Ok(reply),
            Behaviour::Fail(error) => Err(error),
            Behaviour::Slow(delay, reply) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            Behaviour::Stream(pieces, error) => match error {
                Some(error) => Err(error),
                None => Ok(BackendReply::text(pieces.concat())),
            },
        }
    }

    async fn invoke_stream(&self, payload: &BackendPayload) -> Result<BackendStream, BackendError> {
        let behaviour = {
            let (_guard, behaviour) = self.enter(payload);
            behaviour
        };
        match behaviour {
            Behaviour::Stream(pieces, error) => {
                let last = pieces.len().saturating_sub(1);
                let mut items: Vec<Result<BackendDelta, BackendError>> = pieces
                    .into_iter()
                    .enumerate()
                    .map(|(i, content)| {
                        Ok(BackendDelta {
                            content,
                            finish: (i == last && error.is_none()).then_some(ReplyFinish::Stop),
                            usage: None,
                        })
                    })
                    .collect();
                if let Some(error) = error {
                    items.push(Err(error));
                }
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Behaviour::Fail(error) => Err(error),
            Behaviour::Reply(reply) => Ok(Box::pin(futures_util::stream::once(async move {
                Ok(BackendDelta {
                    content: reply.content,
                    finish: Some(reply.finish),
                    usage: reply.usage,
                })
            }))),
            Behaviour::Slow(delay, reply) => Ok(Box::pin(futures_util::stream::once(async move {
                tokio::time::sleep(delay).await;
                Ok(BackendDelta {
                    content: reply.content,
                    finish: Some(reply.finish),
                    usage: reply.usage,
                })
            }))),
        }
    }

    async fn probe(&self) -> Result<(), BackendError> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("probe refused".to_string()))
        }
    }
}
