//! Network addresses (`<user>@<server>`) and outbound normalization.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address '{0}' contains no digits")]
    NoDigits(String),
    #[error("address '{0}' is malformed")]
    Malformed(String),
}

/// How bare phone numbers become canonical addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRules {
    /// Prepended when a bare number doesn't already start with it.
    pub default_country_code: Option<String>,
    /// Server part appended to bare numbers.
    pub suffix: String,
}

impl Default for AddressRules {
    fn default() -> Self {
        Self {
            default_country_code: Some("91".into()),
            suffix: "s.whatsapp.net".into(),
        }
    }
}

/// A network address such as `919876543210@s.whatsapp.net`.
///
/// User parts may carry a device suffix (`919876543210:12@s.whatsapp.net`);
/// [`Address::canonical`] strips it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Wrap an address reported by the network without normalizing it.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Normalize caller input into a sendable address.
    ///
    /// Input that already names a server (`x@y`) is used as given. Anything else
    /// is reduced to its digits, prefixed with the default country code when
    /// missing, and given the default server suffix.
    pub fn parse(raw: &str, rules: &AddressRules) -> Result<Self, AddressError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some((user, server)) = raw.split_once('@') {
            if user.is_empty() || server.is_empty() || server.contains('@') {
                return Err(AddressError::Malformed(raw.to_string()));
            }
            return Ok(Self(raw.to_string()));
        }

        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(AddressError::NoDigits(raw.to_string()));
        }

        let number = match rules.default_country_code.as_deref() {
            Some(cc) if !cc.is_empty() && !digits.starts_with(cc) => format!("{cc}{digits}"),
            _ => digits,
        };
        Ok(Self(format!("{number}@{}", rules.suffix)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// User part without any device suffix.
    pub fn user(&self) -> &str {
        let user = self.0.split_once('@').map_or(self.0.as_str(), |(u, _)| u);
        user.split_once(':').map_or(user, |(u, _)| u)
    }

    /// Server part, empty when the address has none.
    pub fn server(&self) -> &str {
        self.0.split_once('@').map_or("", |(_, s)| s)
    }

    /// The address with any device suffix removed.
    pub fn canonical(&self) -> Self {
        match self.server() {
            "" => Self(self.user().to_string()),
            server => Self(format!("{}@{server}", self.user())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
