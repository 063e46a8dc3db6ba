use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
    DEFAULT_MAX_MESSAGE_SIZE_BYTES,
};
use crate::{
    bson_util,
    conn::command::Command,
    error::{ErrorKind, Result},
};

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    /// Unknown bits are dropped on decode; only the checksum bit affects
    /// parsing.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A section of documents pulled out of line from the command body, identified
/// by the field they splice back into (e.g. `documents`, `updates`, `deletes`).
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

/// Represents an OP_MSG wire protocol operation.
#[derive(Clone, Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Creates a `Message` from the given `Command`.
    pub(crate) fn from_command(mut command: Command, request_id: Option<i32>) -> Self {
        command.body.insert("$db", command.target_db);

        Self {
            response_to: 0,
            flags: MessageFlags::empty(),
            document_payload: command.body,
            document_sequences: command.document_sequences,
            checksum: None,
            request_id,
        }
    }

    /// Consumes the message, returning its command body with any document
    /// sequences spliced back in as array fields.
    pub(crate) fn into_command_body(self) -> Document {
        let mut body = self.document_payload;
        for sequence in self.document_sequences {
            let array: bson::Array = sequence
                .documents
                .into_iter()
                .map(bson::Bson::Document)
                .collect();
            body.insert(sequence.identifier, array);
        }
        body
    }

    /// Serializes this message into a complete framed buffer. Fails without
    /// writing anything if the total size would exceed `max_message_size`.
    pub(crate) fn encode(&self, max_message_size: Option<i32>) -> Result<Vec<u8>> {
        let mut sections = Vec::new();

        // Type-0 section: the command body.
        sections.push(0u8);
        self.document_payload.to_writer(&mut sections)?;

        // Type-1 sections: out-of-line document sequences.
        for sequence in &self.document_sequences {
            sections.push(1u8);

            let mut documents = Vec::new();
            for doc in &sequence.documents {
                doc.to_writer(&mut documents)?;
            }

            // Size covers itself, the identifier with its NUL, and the
            // documents.
            let size = 4 + sequence.identifier.len() + 1 + documents.len();
            sections.extend_from_slice(&(size as i32).to_le_bytes());
            sections.extend_from_slice(sequence.identifier.as_bytes());
            sections.push(0);
            sections.extend_from_slice(&documents);
        }

        let total_length =
            Header::LENGTH + 4 + sections.len() + if self.checksum.is_some() { 4 } else { 0 };

        let max = max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if total_length > max as usize {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "command is too large to send: {} bytes with a {} byte maximum",
                    total_length, max
                ),
            }
            .into());
        }

        let mut flags = self.flags;
        flags.set(MessageFlags::CHECKSUM_PRESENT, self.checksum.is_some());

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id.unwrap_or_else(next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        let mut buf = Vec::with_capacity(total_length);
        header.append_to(&mut buf);
        buf.extend_from_slice(&flags.bits().to_le_bytes());
        buf.extend_from_slice(&sections);
        if let Some(checksum) = self.checksum {
            buf.extend_from_slice(&checksum.to_le_bytes());
        }

        Ok(buf)
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;
        if header.op_code != OpCode::Message {
            return Err(ErrorKind::InvalidResponse {
                message: format!("expected OP_MSG reply, got opcode {:?}", header.op_code),
            }
            .into());
        }
        let mut payload = read_payload(&header, reader).await?;
        Self::decode_payload(&header, &mut payload)
    }

    /// Deserializes a message from its post-header payload bytes.
    pub(crate) fn decode_payload(header: &Header, payload: &[u8]) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(bson_util::read_i32(payload)? as u32);
        let mut remaining = &payload[4..];

        let mut checksum_bytes = 0;
        if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            checksum_bytes = 4;
        }

        let mut document_payload = None;
        let mut document_sequences = Vec::new();

        while remaining.len() > checksum_bytes {
            let kind = remaining[0];
            remaining = &remaining[1..];
            match kind {
                0 => {
                    let (doc, len) = read_document(remaining)?;
                    if document_payload.is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "OP_MSG reply contained multiple body sections".to_string(),
                        }
                        .into());
                    }
                    document_payload = Some(doc);
                    remaining = &remaining[len..];
                }
                1 => {
                    let size = bson_util::read_i32(remaining)? as usize;
                    if size < 4 || size > remaining.len() {
                        return Err(section_length_error(header));
                    }
                    let section = &remaining[4..size];
                    let (identifier, id_len) = bson_util::read_cstring(section)?;
                    let mut docs_bytes = &section[id_len..];
                    let mut documents = Vec::new();
                    while !docs_bytes.is_empty() {
                        let (doc, len) = read_document(docs_bytes)?;
                        documents.push(doc);
                        docs_bytes = &docs_bytes[len..];
                    }
                    document_sequences.push(DocumentSequence {
                        identifier,
                        documents,
                    });
                    remaining = &remaining[size..];
                }
                other => {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("unknown OP_MSG section kind: {}", other),
                    }
                    .into())
                }
            }
        }

        let checksum = if checksum_bytes > 0 {
            if remaining.len() != 4 {
                return Err(section_length_error(header));
            }
            Some(u32::from_le_bytes([
                remaining[0],
                remaining[1],
                remaining[2],
                remaining[3],
            ]))
        } else {
            if !remaining.is_empty() {
                return Err(section_length_error(header));
            }
            None
        };

        let document_payload = document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
            message: "no body section in OP_MSG reply".to_string(),
        })?;

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload,
            document_sequences,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Serializes the message and writes it to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        max_message_size: Option<i32>,
    ) -> Result<()> {
        let buf = self.encode(max_message_size)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn section_length_error(header: &Header) -> crate::error::Error {
    ErrorKind::InvalidResponse {
        message: format!(
            "the server indicated that the reply would be {} bytes long, but its sections did \
             not add up",
            header.length
        ),
    }
    .into()
}

/// Reads one BSON document off the front of `bytes`, returning it and its
/// encoded length.
fn read_document(bytes: &[u8]) -> Result<(Document, usize)> {
    let len = bson_util::read_i32(bytes)? as usize;
    if len < 5 || len > bytes.len() {
        return Err(ErrorKind::InvalidResponse {
            message: "truncated document in wire message".to_string(),
        }
        .into());
    }
    let doc = Document::from_reader(&mut &bytes[..len]).map_err(|e| ErrorKind::InvalidResponse {
        message: format!("invalid document in wire message: {}", e),
    })?;
    Ok((doc, len))
}

/// Reads the post-header remainder of a message into a buffer, enforcing the
/// advertised length.
pub(super) async fn read_payload<R: AsyncRead + Unpin + Send>(
    header: &Header,
    reader: &mut R,
) -> Result<Vec<u8>> {
    let body_len = header.length as i64 - Header::LENGTH as i64;
    if body_len < 4 || header.length > DEFAULT_MAX_MESSAGE_SIZE_BYTES {
        return Err(ErrorKind::InvalidResponse {
            message: format!("invalid wire message length: {}", header.length),
        }
        .into());
    }
    let mut payload = vec![0u8; body_len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;
    use crate::conn::command::Command;

    fn round_trip(message: &Message) -> Message {
        let frame = message.encode(None).unwrap();
        let header = Header::from_slice(&frame).unwrap();
        assert_eq!(header.length as usize, frame.len());
        Message::decode_payload(&header, &frame[Header::LENGTH..]).unwrap()
    }

    #[test]
    fn body_round_trip() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, Some(7));
        let decoded = round_trip(&message);

        assert_eq!(
            decoded.document_payload,
            doc! { "ping": 1, "$db": "admin" }
        );
        assert!(decoded.document_sequences.is_empty());
        assert_eq!(decoded.checksum, None);
    }

    #[test]
    fn document_sequence_round_trip() {
        let mut command = Command::new("insert", "db", doc! { "insert": "coll" });
        command.add_document_sequence(
            "documents",
            vec![doc! { "_id": 1 }, doc! { "_id": 2, "x": "y" }],
        );
        let message = Message::from_command(command, Some(8));
        let decoded = round_trip(&message);

        assert_eq!(decoded.document_payload, doc! { "insert": "coll", "$db": "db" });
        assert_eq!(decoded.document_sequences.len(), 1);
        assert_eq!(decoded.document_sequences[0].identifier, "documents");
        assert_eq!(
            decoded.document_sequences[0].documents,
            vec![doc! { "_id": 1 }, doc! { "_id": 2, "x": "y" }]
        );
    }

    #[test]
    fn checksum_bit_is_honored() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let mut message = Message::from_command(command, Some(9));
        message.checksum = Some(0xDEADBEEF);
        let decoded = round_trip(&message);
        assert_eq!(decoded.checksum, Some(0xDEADBEEF));
        assert!(decoded.flags.contains(MessageFlags::CHECKSUM_PRESENT));
    }

    #[test]
    fn oversized_message_is_refused() {
        let command = Command::new(
            "insert",
            "db",
            doc! { "insert": "coll", "padding": "x".repeat(1024) },
        );
        let message = Message::from_command(command, None);
        let err = message.encode(Some(512)).unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::InvalidArgument { .. }
        ));
    }

    #[test]
    fn truncated_reply_is_rejected() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, Some(10));
        let frame = message.encode(None).unwrap();
        let header = Header::from_slice(&frame).unwrap();
        // Chop the last byte off the payload.
        let truncated = &frame[Header::LENGTH..frame.len() - 1];
        assert!(Message::decode_payload(&header, truncated).is_err());
    }

    #[test]
    fn sequences_splice_back_into_the_body() {
        let mut command = Command::new("insert", "db", doc! { "insert": "coll" });
        command.add_document_sequence("documents", vec![doc! { "_id": 1 }]);
        let message = Message::from_command(command, None);
        let body = round_trip(&message).into_command_body();
        assert_eq!(
            body.get_array("documents").unwrap(),
            &vec![bson::Bson::Document(doc! { "_id": 1 })]
        );
    }
}
