use bson::{doc, oid::ObjectId, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::{
    client::session::ClusterTime,
    conn::command::Command,
    error::{Error, Result},
    options::ServerAddress,
    sdam::ServerType,
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command, which predates its introduction
/// and is still the only name pre-OP_MSG servers understand. To limit usages
/// of the legacy name in the codebase, this constant should be used wherever
/// possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Constructs a hello or legacy hello command.
///
/// If a previous reply indicated `helloOk: true`, `hello` is used. Otherwise
/// the legacy command is used, and if it is not yet known whether the server
/// understands `hello`, the command advertises `helloOk: true`.
pub(crate) fn hello_command(hello_ok: Option<bool>) -> Command {
    let (body, command_name) = if matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    Command::new(command_name, "admin", body)
}

/// A server's complete reply to a hello, along with the address it came from.
#[derive(Clone, Debug)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) cluster_time: Option<ClusterTime>,
}

impl HelloReply {
    /// Interprets a raw command response document as a hello reply. A non-ok
    /// reply during the handshake surfaces as an authentication error.
    pub(crate) fn parse(server_address: ServerAddress, body: Document) -> Result<Self> {
        let ok = body
            .get("ok")
            .and_then(crate::bson_util::get_int)
            .unwrap_or(0);
        if ok != 1 {
            let message = body
                .get_str("errmsg")
                .unwrap_or("handshake command failed")
                .to_string();
            return Err(Error::authentication_error(message));
        }

        let cluster_time = body
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok());

        let command_response: HelloCommandResponse = bson::from_document(body)?;

        Ok(Self {
            server_address,
            command_response,
            cluster_time,
        })
    }
}

/// The response to a `hello` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in
    /// a replica set, a mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    /// Legacy name for the `is_writable_primary` field.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// Whether the server supports the `hello` command for monitoring instead
    /// of the legacy name.
    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passive members of the replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in the replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned
    /// from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this response, as it knows
    /// itself.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    /// Whether the server is a member of an uninitialized replica set.
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most
    /// recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write
    /// operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<ObjectId>,

    /// The address of the current primary member of the replica set, if known.
    pub primary: Option<String>,

    /// The maximum permitted size of a BSON object in bytes.
    pub max_bson_object_size: Option<i64>,

    /// The maximum permitted size of a wire protocol message.
    pub max_message_size_bytes: Option<i32>,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    /// The reply to speculative authentication done in the handshake, if any.
    pub speculative_authenticate: Option<Document>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

/// Optime and date information for the server's most recent write operation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub(crate) last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_type_inference() {
        let mongos = HelloCommandResponse {
            msg: Some("isdbgrid".to_string()),
            ..Default::default()
        };
        assert_eq!(mongos.server_type(), ServerType::Mongos);

        let primary = HelloCommandResponse {
            set_name: Some("rs0".to_string()),
            is_writable_primary: Some(true),
            ..Default::default()
        };
        assert_eq!(primary.server_type(), ServerType::RsPrimary);

        let secondary = HelloCommandResponse {
            set_name: Some("rs0".to_string()),
            secondary: Some(true),
            ..Default::default()
        };
        assert_eq!(secondary.server_type(), ServerType::RsSecondary);

        let ghost = HelloCommandResponse {
            is_replica_set: Some(true),
            ..Default::default()
        };
        assert_eq!(ghost.server_type(), ServerType::RsGhost);

        assert_eq!(
            HelloCommandResponse::default().server_type(),
            ServerType::Standalone
        );
    }
}
