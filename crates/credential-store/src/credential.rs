//! Credential record and its `----`-delimited line format
//!
//! A line has either 3 fields `username----password----key` or 4 fields
//! `username----password----key----token`. The identity key (what the pool
//! deduplicates and exhausts by) is `key` in both shapes; the value sent to
//! the API is always the last field.

use std::fmt;

use common::Secret;

/// Literal separator between fields on a credential line.
pub const FIELD_SEPARATOR: &str = "----";

/// One identity + secret usable to authenticate against the external API.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: Secret<String>,
    key: Secret<String>,
    token: Option<Secret<String>>,
}

impl Credential {
    /// Build a 3-field credential.
    pub fn new(username: impl Into<String>, password: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
            key: Secret::new(key.into()),
            token: None,
        }
    }

    /// Attach a trailing token, turning this into a 4-field credential.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Secret::new(token.into()));
        self
    }

    /// Parse one line. On failure returns the number of fields found.
    pub fn parse(line: &str) -> std::result::Result<Self, usize> {
        let fields: Vec<&str> = line.trim().split(FIELD_SEPARATOR).collect();
        match fields.as_slice() {
            [username, password, key] => Ok(Self::new(*username, *password, *key)),
            [username, password, key, token] => {
                Ok(Self::new(*username, *password, *key).with_token(*token))
            }
            _ => Err(fields.len()),
        }
    }

    /// Serialize back to the on-disk line (without trailing newline).
    pub fn to_line(&self) -> String {
        let mut fields = vec![
            self.username.as_str(),
            self.password.expose().as_str(),
            self.key.expose().as_str(),
        ];
        if let Some(token) = &self.token {
            fields.push(token.expose().as_str());
        }
        fields.join(FIELD_SEPARATOR)
    }

    /// Identity key used for uniqueness and exhaustion bookkeeping.
    pub fn identity(&self) -> &str {
        self.key.expose()
    }

    /// Value to authenticate outbound calls with (the last field).
    pub fn api_key(&self) -> &str {
        match &self.token {
            Some(token) => token.expose(),
            None => self.key.expose(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Number of fields on the serialized line.
    pub fn field_count(&self) -> usize {
        if self.token.is_some() { 4 } else { 3 }
    }

    /// Log-safe label: username plus a masked tail of the identity key.
    pub fn label(&self) -> String {
        format!("{}/{}", self.username, self.key.masked())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("key", &self.key.masked())
            .field("fields", &self.field_count())
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
