//! Opaque, schema-tagged payload blobs.
//!
//! Inputs and results travel as a [`Payload`]: a string body tagged with the
//! schema name and version the producer used. The bridge never interprets
//! the body. Consumers check [`Payload::conforms_to`] against the schema they
//! understand so shape drift between producer and consumer surfaces as an
//! explicit failure instead of a silent misread.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Schema name used by [`Payload::text`].
pub const TEXT_SCHEMA: &str = "text/plain";

/// A schema name paired with the version a consumer accepts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadSchema {
    /// Schema name, e.g. `"birth-date"`.
    pub name: String,
    /// Schema version.
    pub version: u32,
}

impl PayloadSchema {
    /// Creates a schema descriptor.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for PayloadSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Opaque input or output blob with an explicit schema tag.
///
/// # Examples
///
/// ```
/// use taskbridge::{Payload, PayloadSchema};
///
/// let payload = Payload::new("birth-date", 1, "1990-05-12");
/// assert!(payload.conforms_to(&PayloadSchema::new("birth-date", 1)));
/// assert!(!payload.conforms_to(&PayloadSchema::new("birth-date", 2)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Schema name negotiated between producer and consumer.
    pub schema: String,
    /// Schema version.
    pub version: u32,
    /// The opaque body.
    pub body: String,
}

impl Payload {
    /// Creates a payload tagged with `schema` at `version`.
    pub fn new(schema: impl Into<String>, version: u32, body: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            version,
            body: body.into(),
        }
    }

    /// Creates a version 1 plain-text payload.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(TEXT_SCHEMA, 1, body)
    }

    /// Returns the schema descriptor of this payload.
    pub fn schema(&self) -> PayloadSchema {
        PayloadSchema::new(self.schema.clone(), self.version)
    }

    /// Returns `true` if the payload was produced for `schema`.
    pub fn conforms_to(&self, schema: &PayloadSchema) -> bool {
        self.schema == schema.name && self.version == schema.version
    }
}
