#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod address;
pub mod client;
pub mod envelope;
pub mod flows;
pub mod id;
pub mod logging;
pub mod reply;

pub use tracing;

pub use address::{AddressError, EmailAddress, NextHop};
pub use client::{ClientError, EnvelopeStatus, SmtpClient};
pub use envelope::Envelope;
pub use flows::{FlowId, Flows};
pub use id::{EnvelopeId, IdError, IdSource, MessageId};
pub use reply::{RejectedRecipient, Reply};

/// Process-wide lifecycle signal broadcast to every long-running task.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
