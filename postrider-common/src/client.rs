//! The outbound SMTP client contract consumed by the delivery engine.
//!
//! The wire codec itself is a collaborator; the engine only depends on this
//! trait and on the envelope-level outcome it reports.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{envelope::Envelope, flows::Flows, reply::RejectedRecipient, reply::Reply};

/// Transport-level failures from the SMTP client collaborator.
///
/// Protocol-level rejects are not errors: they come back as
/// [`EnvelopeStatus`] variants so the retry scheduler can partition
/// recipients by reply code.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} timed out")]
    Timeout { command: String },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(Reply),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Outcome of submitting one envelope to a downstream server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// The envelope was accepted for at least one recipient.
    Ok {
        /// Queue id the downstream reported in its final `250`.
        remote_id: String,
        rejected_recipients: Vec<RejectedRecipient>,
    },
    /// Every recipient was refused; the envelope never reached DATA.
    NoRecipients {
        rejected_recipients: Vec<RejectedRecipient>,
    },
    /// MAIL FROM was refused.
    RejectedSender { reply: Reply },
    /// MAIL FROM was refused after some recipients already were.
    RejectedSenderAndRecipients {
        reply: Reply,
        rejected_recipients: Vec<RejectedRecipient>,
    },
    /// The message body was refused at or after DATA.
    RejectedBody {
        reply: Reply,
        rejected_recipients: Vec<RejectedRecipient>,
    },
}

impl EnvelopeStatus {
    /// Whether the downstream accepted the envelope for delivery.
    pub const fn accepted(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// An established outbound SMTP session.
///
/// Implementations enforce `send_receive_timeout` per command and
/// `final_ok_timeout` on the closing `250 OK`; the engine only sees the
/// resulting status or error.
#[async_trait]
pub trait SmtpClient: Send {
    /// Submit one envelope plus its raw body on this session.
    ///
    /// # Errors
    /// Only for transport failures; protocol rejects are `Ok(status)`.
    async fn send_envelope(
        &mut self,
        envelope: &Envelope,
        body: Arc<[u8]>,
        flows: &Flows,
    ) -> Result<EnvelopeStatus, ClientError>;

    /// Whether the session can be reused for another envelope.
    fn is_healthy(&self) -> bool;

    /// Close the session gracefully (QUIT); errors are ignored.
    async fn close(&mut self);
}
