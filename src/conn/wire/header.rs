use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorKind, Result};

/// The wire protocol op codes used by this driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    pub(crate) fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Appends the serialized header to `buf`.
    pub(crate) fn append_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    #[allow(unused)]
    pub(crate) async fn write_to<W: AsyncWrite + Unpin + Send>(
        &self,
        stream: &mut W,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(Self::LENGTH);
        self.append_to(&mut buf);
        stream.write_all(&buf).await?;
        Ok(())
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let length = reader.read_i32_le().await?;
        let request_id = reader.read_i32_le().await?;
        let response_to = reader.read_i32_le().await?;
        let op_code = OpCode::from_i32(reader.read_i32_le().await?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    pub(crate) fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "header requires {} bytes but only got {}",
                    Self::LENGTH,
                    data.len()
                ),
            }
            .into());
        }
        let int = |i: usize| {
            i32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]])
        };
        Ok(Self {
            length: int(0),
            request_id: int(4),
            response_to: int(8),
            op_code: OpCode::from_i32(int(12))?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = Header {
            length: 16,
            request_id: 1,
            response_to: 2,
            op_code: OpCode::Message,
        };
        let mut buf = Vec::new();
        header.append_to(&mut buf);
        // OP_MSG is opcode 2013 (0x7dd).
        assert_eq!(hex::encode(&buf), "100000000100000002000000dd070000");

        let decoded = Header::from_slice(&buf).unwrap();
        assert_eq!(decoded.length, 16);
        assert_eq!(decoded.request_id, 1);
        assert_eq!(decoded.response_to, 2);
        assert_eq!(decoded.op_code, OpCode::Message);
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        assert!(OpCode::from_i32(9999).is_err());
    }
}
