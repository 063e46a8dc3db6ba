//! A lightweight client driver core for MongoDB-compatible document databases.
//!
//! The crate covers the concurrent infrastructure between a collection API and
//! the socket: topology discovery and monitoring, server selection, logical
//! sessions with causal consistency, retryable reads and writes, wire protocol
//! framing, cursors and change streams. Documents are encoded and decoded with
//! the [`bson`] crate.
//!
//! ```no_run
//! use mongolite::{bson::doc, Client};
//!
//! # async fn run() -> mongolite::error::Result<()> {
//! let client = Client::with_uri_str("mongodb://localhost:27017/?replicaSet=rs0").await?;
//! let coll = client.database("app").collection("users");
//! coll.insert_one(doc! { "name": "jane" }, None).await?;
//! # Ok(())
//! # }
//! ```

pub use bson;

mod bson_util;
pub mod change_stream;
mod client;
mod coll;
mod concern;
mod conn;
mod cursor;
mod db;
pub mod error;
mod hello;
mod operation;
pub mod results;
mod runtime;
mod sdam;
mod selection_criteria;

#[cfg(test)]
mod test;

pub use crate::{
    change_stream::{event::ResumeToken, ChangeStream},
    client::{
        session::{ClientSession, ClusterTime},
        Client,
    },
    coll::Collection,
    cursor::Cursor,
    db::Database,
    sdam::{ServerInfo, ServerType},
};

/// Contains the options structs for the operations the driver supports, along
/// with read/write concerns and read preferences.
pub mod options {
    pub use crate::{
        change_stream::options::*,
        client::options::*,
        client::session::SessionOptions,
        coll::bulk::WriteModel,
        coll::options::*,
        concern::*,
        selection_criteria::*,
    };
}

use std::{fmt, str::FromStr};

use crate::error::{Error, ErrorKind};

/// A database name paired with a collection name, uniquely identifying a
/// collection within a deployment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The name of the database.
    pub db: String,

    /// The name of the collection.
    pub coll: String,
}

impl Namespace {
    pub(crate) fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(ErrorKind::InvalidResponse {
                message: format!("invalid namespace: {}", s),
            }
            .into()),
        }
    }
}
