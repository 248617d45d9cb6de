//! The demo's one request type: the peer asks, the hub echoes.

use std::sync::atomic::{AtomicU64, Ordering};

use corelink_framework::ids::{KIND_REQUEST, KIND_RESPONSE};
use corelink_framework::{
    EndpointHandle, Message, MessageId, MessageSender, SessionId, TransactionExecutor,
};
use tokio::sync::{mpsc, oneshot};

pub const ECHO_REQUEST: MessageId = MessageId::new(1, 0x20, KIND_REQUEST);
pub const ECHO_RESPONSE: MessageId = MessageId::new(1, 0x20, KIND_RESPONSE);

/// Free text carried both ways.
pub const PARAM_KEY_TEXT: u32 = 100;

pub fn request(seq: u32, text: &str) -> Message {
    let mut msg = Message::new(ECHO_REQUEST);
    msg.set_transaction(seq);
    msg.set_string(PARAM_KEY_TEXT, text);
    msg
}

/// Runs inside a transaction engine session on the hub and sends the
/// request's text back to whoever asked.
pub struct EchoExecutor {
    endpoint: EndpointHandle,
    executed: AtomicU64,
}

impl EchoExecutor {
    pub fn new(endpoint: EndpointHandle) -> Self {
        Self {
            endpoint,
            executed: AtomicU64::new(0),
        }
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl TransactionExecutor for EchoExecutor {
    async fn execute(
        &self,
        session: SessionId,
        request: Message,
        _inbound: mpsc::Receiver<Message>,
        _terminate: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let asker = request.sender().to_string();
        anyhow::ensure!(!asker.is_empty(), "echo request without a sender");

        let mut reply = Message::reply_to(&request, ECHO_RESPONSE);
        reply.set_from_session(session);
        match request.get_string(PARAM_KEY_TEXT) {
            Ok(text) => {
                reply.set_success(true);
                reply.set_string(PARAM_KEY_TEXT, text);
            }
            Err(e) => reply.set_error(e.to_string()),
        }
        self.endpoint.send_message(reply, &asker).await?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("echo: session {session} answered {asker}");
        Ok(())
    }
}
