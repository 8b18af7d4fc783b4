use std::fmt::{self, Display, Formatter};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use careassist_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque position in a session's message log: the creation time (µs) and
/// id of the oldest message on the previous page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: &str) -> Self {
        let raw = format!("{}:{}", created_at.timestamp_micros(), id);
        Self(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }

    /// Parse a client-supplied cursor, rejecting anything we did not issue.
    pub fn parse(raw: &str) -> Result<Self> {
        let cursor = Self(raw.to_string());
        if cursor.decode().is_none() {
            return Err(Error::Validation("invalid cursor".to_string()));
        }
        Ok(cursor)
    }

    pub fn decode(&self) -> Option<(i64, String)> {
        let bytes = URL_SAFE_NO_PAD.decode(&self.0).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        // ids never contain ':' but split on the first one regardless
        let (micros, id) = text.split_once(':')?;
        let micros = micros.parse::<i64>().ok()?;
        if id.is_empty() || DateTime::from_timestamp_micros(micros).is_none() {
            return None;
        }
        Some((micros, id.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
