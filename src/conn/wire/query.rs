//! The legacy OP_QUERY/OP_REPLY message pair. Only used for the initial
//! handshake: the `hello` reply negotiates OP_MSG support, and every
//! subsequent command uses OP_MSG framing.

use bson::Document;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    message::read_payload,
    next_request_id,
};
use crate::{
    bson_util,
    error::{ErrorKind, Result},
};

/// Set on handshakes so that a secondary or recovering member still answers.
const SECONDARY_OK: i32 = 1 << 2;

/// A command sent through the legacy query interface: a single document
/// against the `$cmd` virtual collection of the target database.
#[derive(Debug)]
pub(crate) struct Query {
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Query {
    pub(crate) fn encode(&self, request_id: Option<i32>) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&SECONDARY_OK.to_le_bytes());
        payload.extend_from_slice(format!("{}.$cmd", self.target_db).as_bytes());
        payload.push(0);
        // numberToSkip = 0, numberToReturn = -1 (a single reply document).
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&(-1i32).to_le_bytes());
        self.body.to_writer(&mut payload)?;

        let header = Header {
            length: (Header::LENGTH + payload.len()) as i32,
            request_id: request_id.unwrap_or_else(next_request_id),
            response_to: 0,
            op_code: OpCode::Query,
        };

        let mut buf = Vec::with_capacity(Header::LENGTH + payload.len());
        header.append_to(&mut buf);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        request_id: Option<i32>,
    ) -> Result<()> {
        let buf = self.encode(request_id)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// A reply to a legacy query.
#[derive(Debug)]
pub(crate) struct Reply {
    #[allow(unused)]
    pub(crate) response_to: i32,
    pub(crate) response_flags: i32,
    pub(crate) cursor_id: i64,
    pub(crate) documents: Vec<Document>,
}

/// Bit set in the response flags when the query failed server-side.
const QUERY_FAILURE: i32 = 1 << 1;

impl Reply {
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        if header.op_code != OpCode::Reply {
            return Err(ErrorKind::InvalidResponse {
                message: format!("expected OP_REPLY, got opcode {:?}", header.op_code),
            }
            .into());
        }
        let payload = read_payload(&header, reader).await?;
        Self::decode_payload(&header, &payload)
    }

    pub(crate) fn decode_payload(header: &Header, payload: &[u8]) -> Result<Self> {
        if payload.len() < 20 {
            return Err(ErrorKind::InvalidResponse {
                message: "truncated OP_REPLY".to_string(),
            }
            .into());
        }
        let response_flags = bson_util::read_i32(payload)?;
        let cursor_id = i64::from_le_bytes(payload[4..12].try_into().unwrap());
        let number_returned = bson_util::read_i32(&payload[16..])?;

        let mut documents = Vec::new();
        let mut remaining = &payload[20..];
        while !remaining.is_empty() {
            let len = bson_util::read_i32(remaining)? as usize;
            if len < 5 || len > remaining.len() {
                return Err(ErrorKind::InvalidResponse {
                    message: "truncated document in OP_REPLY".to_string(),
                }
                .into());
            }
            let doc = Document::from_reader(&mut &remaining[..len]).map_err(|e| {
                ErrorKind::InvalidResponse {
                    message: format!("invalid document in OP_REPLY: {}", e),
                }
            })?;
            documents.push(doc);
            remaining = &remaining[len..];
        }

        if documents.len() != number_returned as usize {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "OP_REPLY declared {} documents but contained {}",
                    number_returned,
                    documents.len()
                ),
            }
            .into());
        }

        Ok(Self {
            response_to: header.response_to,
            response_flags,
            cursor_id,
            documents,
        })
    }

    /// The single command response document of a `$cmd` reply.
    pub(crate) fn into_command_response(mut self) -> Result<Document> {
        if self.response_flags & QUERY_FAILURE != 0 {
            let message = self
                .documents
                .first()
                .and_then(|doc| doc.get_str("$err").ok())
                .unwrap_or("query failure")
                .to_string();
            return Err(ErrorKind::InvalidResponse { message }.into());
        }
        if self.documents.len() != 1 {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "expected a single command response document, got {}",
                    self.documents.len()
                ),
            }
            .into());
        }
        Ok(self.documents.remove(0))
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn query_encodes_the_cmd_namespace() {
        let query = Query {
            target_db: "admin".to_string(),
            body: doc! { "isMaster": 1 },
        };
        let frame = query.encode(Some(42)).unwrap();
        let header = Header::from_slice(&frame).unwrap();
        assert_eq!(header.op_code, OpCode::Query);
        assert_eq!(header.length as usize, frame.len());
        assert_eq!(header.request_id, 42);

        let payload = &frame[Header::LENGTH..];
        let (ns, _) = crate::bson_util::read_cstring(&payload[4..]).unwrap();
        assert_eq!(ns, "admin.$cmd");
    }

    #[test]
    fn reply_round_trip() {
        let body = doc! { "ok": 1, "maxWireVersion": 17 };
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&0i64.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&1i32.to_le_bytes());
        body.to_writer(&mut payload).unwrap();

        let header = Header {
            length: (Header::LENGTH + payload.len()) as i32,
            request_id: 1,
            response_to: 42,
            op_code: OpCode::Reply,
        };

        let reply = Reply::decode_payload(&header, &payload).unwrap();
        assert_eq!(reply.cursor_id, 0);
        assert_eq!(reply.into_command_response().unwrap(), body);
    }
}
