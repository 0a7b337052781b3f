//! Username validation
//!
//! A username names one topic. Only `[A-Za-z0-9_-]` with a length of 1 to
//! 15 is accepted, and the stored form is lower-cased so `Alice` and
//! `alice` share one poller.

use std::fmt;

use crate::utils::error::UsernameError;

pub const MAX_USERNAME_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
    pub fn parse(raw: &str) -> Result<Self, UsernameError> {
        if raw.is_empty() {
            return Err(UsernameError::Missing);
        }
        let valid = raw.len() <= MAX_USERNAME_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(UsernameError::Invalid(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
