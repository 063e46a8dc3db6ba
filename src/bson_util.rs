use bson::{Bson, Document};

use crate::error::{ErrorKind, Result};

/// Coerces numeric BSON values into an `i64` if they can be represented
/// without loss.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

pub(crate) fn get_u64(val: &Bson) -> Option<u64> {
    get_int(val).and_then(|i| u64::try_from(i).ok())
}

/// The name of the command a body describes is always its first key.
pub(crate) fn first_key(document: &Document) -> Option<&str> {
    document.keys().next().map(String::as_str)
}

/// The encoded size of a document, in bytes.
pub(crate) fn doc_size_bytes(doc: &Document) -> Result<usize> {
    let mut buf = Vec::new();
    doc.to_writer(&mut buf)?;
    Ok(buf.len())
}

/// Reads a NUL-terminated UTF-8 string from the front of `bytes`, returning it
/// along with the number of bytes consumed (including the terminator).
pub(crate) fn read_cstring(bytes: &[u8]) -> Result<(String, usize)> {
    let nul = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ErrorKind::InvalidResponse {
            message: "unterminated cstring in wire message".to_string(),
        })?;
    let s = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| ErrorKind::InvalidResponse {
            message: "invalid UTF-8 in wire message identifier".to_string(),
        })?
        .to_string();
    Ok((s, nul + 1))
}

/// Reads a little-endian `i32` from the front of `bytes`.
pub(crate) fn read_i32(bytes: &[u8]) -> Result<i32> {
    if bytes.len() < 4 {
        return Err(ErrorKind::InvalidResponse {
            message: "truncated wire message".to_string(),
        }
        .into());
    }
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn get_int_coerces_lossless_doubles() {
        assert_eq!(get_int(&Bson::Double(1.0)), Some(1));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::Int32(5)), Some(5));
        assert_eq!(get_int(&Bson::String("1".to_string())), None);
    }

    #[test]
    fn first_key_is_command_name() {
        assert_eq!(first_key(&doc! { "find": "c", "filter": {} }), Some("find"));
        assert_eq!(first_key(&doc! {}), None);
    }

    #[test]
    fn cstring_round_trip() {
        let (s, n) = read_cstring(b"documents\0rest").unwrap();
        assert_eq!(s, "documents");
        assert_eq!(n, 10);
        assert!(read_cstring(b"no-terminator").is_err());
    }
}
