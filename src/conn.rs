pub(crate) mod command;
pub(crate) mod handshake;
pub(crate) mod pool;
pub(crate) mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

pub(crate) use self::{
    command::{Command, RawCommandResponse},
    handshake::Handshaker,
    pool::ConnectionPool,
    stream_description::StreamDescription,
};

use self::wire::{next_request_id, Message, Query, Reply};
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One authenticated socket to one server. A `Connection` is exclusively owned
/// while in use: it is checked out of a pool for the duration of a single
/// operation and never interleaved.
#[derive(Debug)]
pub(crate) struct Connection {
    /// A driver-generated identifier, unique within the owning pool.
    pub(crate) id: u32,

    /// The address of the server this connection is to.
    pub(crate) address: ServerAddress,

    /// The pool generation this connection belongs to. Connections from
    /// cleared generations are discarded at check-in/check-out.
    pub(crate) generation: u32,

    stream: TcpStream,
    stream_description: Option<StreamDescription>,

    /// Set when a network error occurs on this connection. Poisoned
    /// connections are never returned to their pool.
    pub(crate) poisoned: bool,

    socket_timeout: Option<Duration>,

    /// When the connection was last returned to its pool; used to enforce
    /// `maxIdleTimeMS`.
    pub(crate) ready_and_available_time: Option<Instant>,
}

impl Connection {
    /// Opens a TCP connection to the given address. No handshake is performed
    /// here; the caller decides whether this is a data-path or monitoring
    /// connection and drives the handshake itself.
    pub(crate) async fn connect(
        address: ServerAddress,
        id: u32,
        generation: u32,
        connect_timeout: Option<Duration>,
        socket_timeout: Option<Duration>,
    ) -> Result<Self> {
        let connect_timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let stream = match timeout(
            connect_timeout,
            TcpStream::connect((address.host().to_string(), address.port())),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::network_timeout()),
        };
        stream.set_nodelay(true)?;

        debug!(address = %address, id, "established connection");

        Ok(Self {
            id,
            address,
            generation,
            stream,
            stream_description: None,
            poisoned: false,
            socket_timeout,
            ready_and_available_time: None,
        })
    }

    /// The negotiated description of the server on the other end of this
    /// connection. Only available after the handshake has completed.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description
            .as_ref()
            .ok_or_else(|| Error::internal("stream description not available on connection"))
    }

    pub(crate) fn set_stream_description(&mut self, description: StreamDescription) {
        self.stream_description = Some(description);
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.stream_description
            .as_ref()
            .map(|sd| sd.supports_sessions())
            .unwrap_or(false)
    }

    /// Sends a command over OP_MSG framing and reads the reply. Any socket
    /// failure, timeout, or framing violation poisons the connection.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: Option<i32>,
    ) -> Result<RawCommandResponse> {
        if let Some(ref sd) = self.stream_description {
            if !sd.supports_op_msg() {
                return Err(unsupported_op_msg_error(&self.address));
            }
        }
        let max_message_size = self
            .stream_description
            .as_ref()
            .map(|sd| sd.max_message_size_bytes);
        let message = Message::from_command(command, Some(request_id.unwrap_or_else(next_request_id)));
        // Refusing to emit an oversized message is not a connection fault.
        let buf = message.encode(max_message_size)?;

        let result = self.round_trip_msg(&buf).await;
        if result.is_err() {
            self.poisoned = true;
        }
        let reply = result?;
        Ok(RawCommandResponse::new(self.address.clone(), reply))
    }

    async fn round_trip_msg(&mut self, buf: &[u8]) -> Result<Message> {
        use tokio::io::AsyncWriteExt;

        match self.socket_timeout {
            Some(dur) => {
                let io = async {
                    self.stream.write_all(buf).await?;
                    self.stream.flush().await?;
                    Message::read_from(&mut self.stream).await
                };
                match timeout(dur, io).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::network_timeout()),
                }
            }
            None => {
                self.stream.write_all(buf).await?;
                self.stream.flush().await?;
                Message::read_from(&mut self.stream).await
            }
        }
    }

    /// Sends a command through the legacy query interface, used during the
    /// handshake before OP_MSG support has been negotiated.
    pub(crate) async fn send_handshake_query(
        &mut self,
        query: Query,
    ) -> Result<bson::Document> {
        let buf = query.encode(Some(next_request_id()))?;
        let result = self.round_trip_query(&buf).await;
        if result.is_err() {
            self.poisoned = true;
        }
        result?.into_command_response()
    }

    async fn round_trip_query(&mut self, buf: &[u8]) -> Result<Reply> {
        use tokio::io::AsyncWriteExt;

        match self.socket_timeout {
            Some(dur) => {
                let io = async {
                    self.stream.write_all(buf).await?;
                    self.stream.flush().await?;
                    Reply::read_from(&mut self.stream).await
                };
                match timeout(dur, io).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::network_timeout()),
                }
            }
            None => {
                self.stream.write_all(buf).await?;
                self.stream.flush().await?;
                Reply::read_from(&mut self.stream).await
            }
        }
    }

    /// Sends a hello over whichever framing the connection has negotiated.
    /// Before the first handshake completes this is the legacy query path.
    pub(crate) async fn send_hello(&mut self, command: Command) -> Result<bson::Document> {
        let supports_op_msg = self
            .stream_description
            .as_ref()
            .map(|sd| sd.supports_op_msg())
            .unwrap_or(false);
        if supports_op_msg {
            let response = self.send_command(command, None).await?;
            Ok(response.raw_body().clone())
        } else {
            self.send_handshake_query(Query {
                target_db: command.target_db,
                body: command.body,
            })
            .await
        }
    }

    /// Whether this connection has been idle longer than the pool allows.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (max_idle_time, self.ready_and_available_time) {
            (Some(max_idle), Some(ready)) => ready.elapsed() > max_idle,
            _ => false,
        }
    }
}

pub(crate) fn unsupported_op_msg_error(address: &ServerAddress) -> Error {
    ErrorKind::IncompatibleServer {
        message: format!(
            "server at {} does not support OP_MSG, which this driver requires for all commands \
             after the handshake",
            address
        ),
    }
    .into()
}
