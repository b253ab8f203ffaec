use std::{
    fmt::{self, Display},
    str::FromStr,
};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize, de};
use thiserror::Error;

/// Errors produced while parsing addresses and next-hops.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The input is not a single, plain `local@domain` address.
    #[error("Invalid email address {0:?}: {1}")]
    InvalidEmail(String, String),

    /// The input is not a `host:port` pair.
    #[error("Invalid next-hop {0:?}: expected host:port")]
    InvalidNextHop(String),
}

/// A validated `local@domain` email address.
///
/// Parsing goes through [`mailparse::addrparse`] so display names and
/// RFC 5322 quoting are accepted on input; only the bare address is kept.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Parse a single email address.
    ///
    /// # Errors
    /// If the input is empty, a group, a list, or has no domain part.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let parsed = mailparse::addrparse(input)
            .map_err(|e| AddressError::InvalidEmail(input.to_string(), e.to_string()))?;

        match parsed.first() {
            Some(MailAddr::Single(single)) if parsed.len() == 1 => {
                if single.addr.split('@').count() == 2
                    && !single.addr.starts_with('@')
                    && !single.addr.ends_with('@')
                {
                    Ok(Self(single.addr.clone()))
                } else {
                    Err(AddressError::InvalidEmail(
                        input.to_string(),
                        "missing local or domain part".to_string(),
                    ))
                }
            }
            _ => Err(AddressError::InvalidEmail(
                input.to_string(),
                "expected exactly one address".to_string(),
            )),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domain part, after the `@`.
    ///
    /// # Panics
    /// Never: the `@` separator is checked at parse time.
    pub fn domain(&self) -> &str {
        self.0
            .rsplit_once('@')
            .expect("validated at parse time")
            .1
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EmailAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for EmailAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EmailAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Addr;

        impl de::Visitor<'_> for Addr {
            type Value = EmailAddress;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an email address")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                EmailAddress::parse(v)
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(v), &Self))
            }
        }

        deserializer.deserialize_str(Addr)
    }
}

/// `(host, port)` of a downstream SMTP server this relay delivers to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NextHop {
    host: String,
    port: u16,
}

impl NextHop {
    /// # Errors
    /// If the host is empty.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressError> {
        let host = host.into();
        if host.is_empty() {
            return Err(AddressError::InvalidNextHop(format!(":{port}")));
        }
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NextHop {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::InvalidNextHop(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| AddressError::InvalidNextHop(s.to_string()))?;
        Self::new(host, port)
    }
}

impl Serialize for NextHop {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NextHop {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_quoted_addresses() {
        let bare = EmailAddress::parse("a@x.com").unwrap();
        assert_eq!(bare.as_str(), "a@x.com");
        assert_eq!(bare.domain(), "x.com");

        let named = EmailAddress::parse("Alice <alice@example.org>").unwrap();
        assert_eq!(named.as_str(), "alice@example.org");
    }

    #[test]
    fn rejects_lists_and_bare_words() {
        assert!(EmailAddress::parse("a@x.com, b@y.com").is_err());
        assert!(EmailAddress::parse("not-an-address").is_err());
        assert!(EmailAddress::parse("").is_err());
    }

    #[test]
    fn next_hop_round_trips_through_display() {
        let hop: NextHop = "mx.example.net:2525".parse().unwrap();
        assert_eq!(hop.host(), "mx.example.net");
        assert_eq!(hop.port(), 2525);
        assert_eq!(hop.to_string().parse::<NextHop>().unwrap(), hop);

        assert!("no-port".parse::<NextHop>().is_err());
        assert!(":25".parse::<NextHop>().is_err());
    }
}
