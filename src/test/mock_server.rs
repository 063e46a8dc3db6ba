//! A minimal in-process server speaking just enough of the wire protocol for
//! scenario tests: OP_QUERY hello handshakes, OP_MSG commands with scripted
//! replies, and sensible defaults for everything else.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use bson::{doc, Document};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    bson_util,
    conn::wire::{Header, Message, OpCode},
    options::ServerAddress,
};

#[derive(Default)]
struct MockState {
    /// The hello reply body, sent for both the OP_QUERY handshake and OP_MSG
    /// hello checks.
    hello: Mutex<Document>,

    /// Scripted replies: the first queued entry whose command name matches an
    /// incoming command is consumed for it.
    replies: Mutex<VecDeque<(String, Document)>>,

    /// Every non-hello command body received, in arrival order.
    commands: Mutex<Vec<Document>>,
}

/// A TCP server for driving the client against controlled replies.
pub(crate) struct MockServer {
    address: ServerAddress,
    state: Arc<MockState>,
}

impl MockServer {
    /// Starts a mock server presenting as a one-member replica set primary
    /// (so sessions and retryable writes are on the table).
    pub(crate) async fn start() -> Self {
        Self::start_with_hello(Self::primary_hello_template()).await
    }

    /// The base hello body used by [`start`]; `me`, `hosts`, and `setName`
    /// are filled in once the listen address is known.
    pub(crate) fn primary_hello_template() -> Document {
        doc! {
            "ok": 1,
            "ismaster": true,
            "helloOk": true,
            "minWireVersion": 0,
            "maxWireVersion": 8,
            "logicalSessionTimeoutMinutes": 30,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48_000_000,
            "maxWriteBatchSize": 100_000,
        }
    }

    pub(crate) async fn start_with_hello(mut hello: Document) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let address = ServerAddress::Tcp {
            host: local.ip().to_string(),
            port: Some(local.port()),
        };

        let address_string = address.to_string();
        hello.insert("setName", "rs0");
        hello.insert("me", address_string.clone());
        hello.insert("hosts", vec![address_string]);

        let state = Arc::new(MockState {
            hello: Mutex::new(hello),
            ..Default::default()
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, conn_state).await;
                });
            }
        });

        Self { address, state }
    }

    pub(crate) fn uri(&self) -> String {
        format!("mongodb://{}", self.address)
    }

    /// Queues a one-shot reply for the next command with the given name.
    pub(crate) fn queue_reply(&self, command_name: &str, reply: Document) {
        self.state
            .replies
            .lock()
            .unwrap()
            .push_back((command_name.to_string(), reply));
    }

    /// All received command bodies whose command name matches.
    pub(crate) fn received_with_name(&self, name: &str) -> Vec<Document> {
        self.state
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|body| bson_util::first_key(body) == Some(name))
            .cloned()
            .collect()
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<MockState>) -> std::io::Result<()> {
    loop {
        let header = match Header::read_from(&mut stream).await {
            Ok(header) => header,
            Err(_) => return Ok(()),
        };
        let payload_len = (header.length as usize).saturating_sub(Header::LENGTH);
        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).await?;

        match header.op_code {
            OpCode::Query => {
                let reply = state.hello.lock().unwrap().clone();
                write_op_reply(&mut stream, header.request_id, reply).await?;
            }
            OpCode::Message => {
                let message = match Message::decode_payload(&header, &payload) {
                    Ok(message) => message,
                    Err(_) => return Ok(()),
                };
                let body = message.into_command_body();
                let name = bson_util::first_key(&body).unwrap_or_default().to_string();

                let reply_body = if is_hello(&name) {
                    state.hello.lock().unwrap().clone()
                } else {
                    state.commands.lock().unwrap().push(body.clone());
                    scripted_or_default_reply(&state, &name, &body)
                };

                let reply = Message {
                    response_to: header.request_id,
                    flags: Default::default(),
                    document_payload: reply_body,
                    document_sequences: Vec::new(),
                    checksum: None,
                    request_id: None,
                };
                let buf = match reply.encode(None) {
                    Ok(buf) => buf,
                    Err(_) => return Ok(()),
                };
                stream.write_all(&buf).await?;
                stream.flush().await?;
            }
            OpCode::Reply => return Ok(()),
        }
    }
}

fn is_hello(name: &str) -> bool {
    let name = name.to_lowercase();
    name == "hello" || name == "ismaster"
}

fn scripted_or_default_reply(state: &MockState, name: &str, body: &Document) -> Document {
    {
        let mut replies = state.replies.lock().unwrap();
        if let Some(position) = replies.iter().position(|(queued, _)| queued == name) {
            // VecDeque::remove preserves the order of the remaining entries.
            if let Some((_, reply)) = replies.remove(position) {
                return reply;
            }
        }
    }

    match name {
        "insert" => {
            let n = body
                .get_array("documents")
                .map(|docs| docs.len() as i64)
                .unwrap_or(0);
            doc! { "ok": 1, "n": n }
        }
        "update" => {
            let n = body
                .get_array("updates")
                .map(|updates| updates.len() as i64)
                .unwrap_or(0);
            doc! { "ok": 1, "n": n, "nModified": n }
        }
        "delete" => {
            let n = body
                .get_array("deletes")
                .map(|deletes| deletes.len() as i64)
                .unwrap_or(0);
            doc! { "ok": 1, "n": n }
        }
        "find" | "aggregate" | "listCollections" | "listIndexes" => {
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [] } }
        }
        "getMore" => {
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.coll", "nextBatch": [] } }
        }
        _ => doc! { "ok": 1 },
    }
}

/// Writes a legacy OP_REPLY containing a single document.
async fn write_op_reply(
    stream: &mut TcpStream,
    response_to: i32,
    body: Document,
) -> std::io::Result<()> {
    let mut doc_bytes = Vec::new();
    body.to_writer(&mut doc_bytes)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidData))?;

    let mut payload = Vec::new();
    payload.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
    payload.extend_from_slice(&0i64.to_le_bytes()); // cursorId
    payload.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    payload.extend_from_slice(&1i32.to_le_bytes()); // numberReturned
    payload.extend_from_slice(&doc_bytes);

    let header = Header {
        length: (Header::LENGTH + payload.len()) as i32,
        request_id: 0,
        response_to,
        op_code: OpCode::Reply,
    };

    let mut buf = Vec::with_capacity(Header::LENGTH + payload.len());
    header.append_to(&mut buf);
    buf.extend_from_slice(&payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
