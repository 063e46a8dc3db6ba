use bson::{doc, Document};

use super::{stream_description::StreamDescription, wire::Query, Connection};
use crate::{
    error::Result,
    hello::{hello_command, HelloReply},
    options::{ClientOptions, Credential},
};

/// Contains the logic to run the initial `hello` against a new connection and
/// populate the connection's negotiated limits from the reply.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    client_metadata: Document,
    credential: Option<Credential>,
}

impl Handshaker {
    /// Creates a new Handshaker, assembling the client metadata document sent
    /// in the first hello on every connection.
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let mut client_metadata = doc! {
            "driver": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        };

        if let Some(ref app_name) = options.app_name {
            client_metadata.insert("application", doc! { "name": app_name.clone() });
        }

        Self {
            client_metadata,
            credential: options.credential.clone(),
        }
    }

    /// Runs the handshake on a freshly connected stream: a `hello` with client
    /// metadata (and the authentication speculation hook, when a credential is
    /// configured), sent over legacy framing since OP_MSG support is not yet
    /// negotiated. Populates the connection's stream description.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloReply> {
        let mut command = hello_command(None);
        command.body.insert("client", self.client_metadata.clone());

        if let Some(ref credential) = self.credential {
            if let Some(ref username) = credential.username {
                // The speculative-authentication hook: advertise the user so
                // the server can begin the SASL conversation in its reply.
                // The mechanisms themselves are an external collaborator.
                command
                    .body
                    .insert("saslSupportedMechs", format!("admin.{}", username));
            }
        }

        let body = conn
            .send_handshake_query(Query {
                target_db: command.target_db,
                body: command.body,
            })
            .await?;

        let reply = HelloReply::parse(conn.address.clone(), body)?;
        conn.set_stream_description(StreamDescription::from_hello_reply(&reply));

        Ok(reply)
    }
}
