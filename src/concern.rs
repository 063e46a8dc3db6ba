//! Contains the types for read concerns and write concerns.

use std::time::Duration;

use bson::{doc, Document};

use crate::error::{Error, Result};

/// Specifies the consistency and isolation properties of read operations.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/read-concern/) for
/// more information about read concerns.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The level of the read concern.
    pub level: ReadConcernLevel,
}

/// Specifies the level consistency and isolation properties of a given
/// `ReadConcern`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-local/).
    Local,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-majority/).
    Majority,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-linearizable/).
    Linearizable,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-available/).
    Available,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-snapshot/).
    Snapshot,

    /// Specify a custom read concern level. This is present to provide forwards
    /// compatibility with any future read concerns which may be added to new
    /// versions of the server.
    Custom(String),
}

impl ReadConcern {
    /// Creates a read concern with level "majority".
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// Creates a read concern with level "local".
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    /// Creates a read concern with level "linearizable".
    pub fn linearizable() -> Self {
        ReadConcernLevel::Linearizable.into()
    }

    /// Creates a read concern with level "available".
    pub fn available() -> Self {
        ReadConcernLevel::Available.into()
    }

    pub(crate) fn to_document(&self) -> Document {
        doc! { "level": self.level.as_str() }
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

impl ReadConcernLevel {
    pub(crate) fn from_str(s: &str) -> Self {
        match s {
            "local" => ReadConcernLevel::Local,
            "majority" => ReadConcernLevel::Majority,
            "linearizable" => ReadConcernLevel::Linearizable,
            "available" => ReadConcernLevel::Available,
            "snapshot" => ReadConcernLevel::Snapshot,
            s => ReadConcernLevel::Custom(s.to_string()),
        }
    }

    /// Gets the string representation of the `ReadConcernLevel`.
    pub(crate) fn as_str(&self) -> &str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Snapshot => "snapshot",
            ReadConcernLevel::Custom(ref s) => s,
        }
    }
}

/// The level of acknowledgment requested from the server for write operations.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Requires acknowledgment that the write has reached the specified number
    /// of nodes. A value of 0 requests no acknowledgment.
    Nodes(u32),

    /// Requires acknowledgment that the write has reached the majority of
    /// data-bearing voting nodes.
    Majority,

    /// Requires acknowledgment according to the given custom write concern
    /// configured on the server.
    Custom(String),
}

impl From<u32> for Acknowledgment {
    fn from(i: u32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<&str> for Acknowledgment {
    fn from(s: &str) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Custom(s.to_string())
        }
    }
}

impl Acknowledgment {
    fn to_bson(&self) -> bson::Bson {
        match self {
            Acknowledgment::Nodes(i) => bson::Bson::Int32(*i as i32),
            Acknowledgment::Majority => bson::Bson::String("majority".to_string()),
            Acknowledgment::Custom(s) => bson::Bson::String(s.clone()),
        }
    }
}

/// Specifies the level of acknowledgment requested from the server for a write
/// operation.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/write-concern/) for
/// more information about write concerns.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct WriteConcern {
    /// The requested acknowledgment level.
    pub w: Option<Acknowledgment>,

    /// Specifies a time limit for the write concern to be satisfied. This only
    /// applies to non-zero `w` values; the write itself may still be applied
    /// after the timeout elapses.
    pub w_timeout: Option<Duration>,

    /// Requires the write to have reached the on-disk journal.
    pub journal: Option<bool>,
}

impl WriteConcern {
    /// A write concern of `w: "majority"`.
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            ..Default::default()
        }
    }

    /// Whether the server will acknowledge this write. Unacknowledged writes
    /// must not carry a session or a transaction number.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Whether any of the fields of the write concern are set.
    pub(crate) fn is_some(&self) -> bool {
        self.w.is_some() || self.w_timeout.is_some() || self.journal.is_some()
    }

    /// Validates that the write concern is self-consistent.
    pub fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and journal=true",
            ));
        }
        Ok(())
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(ref w) = self.w {
            doc.insert("w", w.to_bson());
        }
        if let Some(w_timeout) = self.w_timeout {
            doc.insert("wtimeout", w_timeout.as_millis() as i64);
        }
        if let Some(journal) = self.journal {
            doc.insert("j", journal);
        }
        doc
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unacknowledged_detection() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(0)),
            ..Default::default()
        };
        assert!(!wc.is_acknowledged());
        assert!(WriteConcern::default().is_acknowledged());
        assert!(WriteConcern::majority().is_acknowledged());
    }

    #[test]
    fn w_zero_with_journal_rejected() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(0)),
            journal: Some(true),
            ..Default::default()
        };
        assert!(wc.validate().is_err());
    }

    #[test]
    fn document_rendering() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Majority),
            w_timeout: Some(Duration::from_millis(100)),
            journal: Some(true),
        };
        assert_eq!(
            wc.to_document(),
            bson::doc! { "w": "majority", "wtimeout": 100_i64, "j": true }
        );
    }
}
