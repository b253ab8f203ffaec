use serde::{Deserialize, Serialize};

use crate::{address::EmailAddress, reply::RejectedRecipient};

/// The SMTP transaction record accepted by the front-end: sender, sender
/// arguments, and the recipient sets as they stood at acceptance time.
///
/// The raw message body travels separately as an opaque byte blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: EmailAddress,
    /// ESMTP MAIL FROM arguments (SIZE, BODY, ...), verbatim.
    pub sender_params: Vec<String>,
    pub recipients: Vec<EmailAddress>,
    /// Recipients the front-end already refused at ingress.
    pub rejected_recipients: Vec<RejectedRecipient>,
}

impl Envelope {
    pub fn new(sender: EmailAddress, recipients: Vec<EmailAddress>) -> Self {
        Self {
            sender,
            sender_params: Vec::new(),
            recipients,
            rejected_recipients: Vec::new(),
        }
    }

    /// The same envelope aimed at a different recipient set, e.g. the
    /// still-remaining recipients of a retry.
    #[must_use]
    pub fn with_recipients(&self, recipients: Vec<EmailAddress>) -> Self {
        Self {
            sender: self.sender.clone(),
            sender_params: self.sender_params.clone(),
            recipients,
            rejected_recipients: self.rejected_recipients.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_recipients_replaces_only_the_recipient_set() {
        let sender = EmailAddress::parse("a@x.com").unwrap();
        let b = EmailAddress::parse("b@y.com").unwrap();
        let c = EmailAddress::parse("c@y.com").unwrap();

        let mut envelope = Envelope::new(sender.clone(), vec![b.clone(), c]);
        envelope.sender_params.push("SIZE=1024".to_string());

        let narrowed = envelope.with_recipients(vec![b.clone()]);
        assert_eq!(narrowed.sender, sender);
        assert_eq!(narrowed.sender_params, envelope.sender_params);
        assert_eq!(narrowed.recipients, vec![b]);
    }
}
