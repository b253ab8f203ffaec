use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::address::EmailAddress;

/// An SMTP reply as received from a downstream server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// 5xx replies: the request will never succeed as-is.
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// 4xx replies: the request may succeed later.
    pub const fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// A recipient the downstream server refused, with the reply it gave.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecipient {
    pub recipient: EmailAddress,
    pub reply: Reply,
}

impl RejectedRecipient {
    pub fn new(recipient: EmailAddress, reply: Reply) -> Self {
        Self { recipient, reply }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_classes() {
        assert!(Reply::new(550, "no such user").is_permanent());
        assert!(!Reply::new(550, "no such user").is_transient());
        assert!(Reply::new(451, "try again").is_transient());
        assert!(Reply::new(250, "ok").is_success());
        assert!(!Reply::new(250, "ok").is_permanent());
    }
}
