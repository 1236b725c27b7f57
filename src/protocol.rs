//! The minimal wire surface of the tus protocol family: header names, header
//! values, and the two dialects this driver understands.

use std::collections::BTreeMap;

use base64::Engine;

use crate::error::{Error, HttpExchange};

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_DRAFT_INTEROP: &str = "Upload-Draft-Interop-Version";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_DEFER_LENGTH: &str = "Upload-Defer-Length";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_CONCAT: &str = "Upload-Concat";
pub const HEADER_UPLOAD_COMPLETE: &str = "Upload-Complete";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_METHOD_OVERRIDE: &str = "X-HTTP-Method-Override";
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";
pub const HEADER_LOCATION: &str = "Location";

pub const CONTENT_TYPE_OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Value carried on `Upload-Defer-Length`. The protocol mandates the ASCII
/// string `"1"`, not a JSON/numeric `1`.
pub const DEFER_LENGTH_VALUE: &str = "1";

/// Which wire dialect to speak.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Protocol {
    /// The stable, widely deployed tus v1.0.0 protocol.
    #[default]
    V1,
    /// The interop draft, identified by `Upload-Draft-Interop-Version: 5`.
    Draft,
}

impl Protocol {
    /// The protocol-version header name/value pair every request carries.
    pub fn resumable_header(self) -> (&'static str, &'static str) {
        match self {
            Protocol::V1 => (HEADER_TUS_RESUMABLE, "1.0.0"),
            Protocol::Draft => (HEADER_DRAFT_INTEROP, "5"),
        }
    }

    /// Whether this dialect uses `Upload-Complete` to mark the last chunk of
    /// a request, instead of relying solely on offset bookkeeping.
    pub fn uses_upload_complete(self) -> bool {
        matches!(self, Protocol::Draft)
    }
}

/// Encode upload metadata into the `Upload-Metadata` header value:
/// `<key> <base64(value)>` pairs, comma-separated. Returns `None` when the
/// map is empty, since the header should be omitted entirely in that case.
pub fn encode_metadata(metadata: &BTreeMap<String, Vec<u8>>) -> Option<String> {
    if metadata.is_empty() {
        return None;
    }
    let engine = base64::engine::general_purpose::STANDARD;
    Some(
        metadata
            .iter()
            .map(|(key, value)| format!("{} {}", key, engine.encode(value)))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Decode an `Upload-Metadata` header value back into a map. Not needed by
/// the upload path itself (the driver only ever writes this header), but
/// kept public since it's the inverse half of a testable round-trip law and
/// useful for anyone debugging a server's view of a request.
pub fn decode_metadata(header: &str) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut map = BTreeMap::new();
    let header = header.trim();
    if header.is_empty() {
        return Ok(map);
    }
    for pair in header.split(',') {
        let pair = pair.trim();
        let mut parts = pair.splitn(2, ' ');
        let key = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            Error::Protocol {
                exchange: HttpExchange::default(),
                detail: "empty key in Upload-Metadata pair".to_owned(),
            }
        })?;
        let value = parts.next().unwrap_or("");
        let bytes = engine.decode(value).map_err(|e| Error::Protocol {
            exchange: HttpExchange::default(),
            detail: format!("invalid base64 in Upload-Metadata value for {key:?}: {e}"),
        })?;
        map.insert(key.to_owned(), bytes);
    }
    Ok(map)
}

/// Validate a metadata key: ASCII, and must not contain a space or a comma
/// (those are the pair/field separators in `Upload-Metadata`).
pub fn validate_metadata_key(key: &str) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::Configuration("metadata key must not be empty".to_owned()));
    }
    if !key.is_ascii() {
        return Err(Error::Configuration(format!("metadata key {key:?} must be ASCII")));
    }
    if key.contains(' ') || key.contains(',') {
        return Err(Error::Configuration(format!(
            "metadata key {key:?} must not contain a space or comma"
        )));
    }
    Ok(())
}

/// Is this HTTP status code in the 2xx success class?
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips() {
        let mut map = BTreeMap::new();
        map.insert("filename".to_owned(), b"world_domination_plan.pdf".to_vec());
        map.insert("is_confidential".to_owned(), b"yes".to_vec());
        let header = encode_metadata(&map).expect("non-empty map must produce a header");
        let decoded = decode_metadata(&header).unwrap();
        assert_eq!(map, decoded);
    }

    #[test]
    fn empty_metadata_omits_header() {
        assert_eq!(encode_metadata(&BTreeMap::new()), None);
    }

    #[test]
    fn metadata_key_rejects_space_and_comma() {
        assert!(validate_metadata_key("has space").is_err());
        assert!(validate_metadata_key("has,comma").is_err());
        assert!(validate_metadata_key("plainkey").is_ok());
    }

    #[test]
    fn defer_length_value_is_the_ascii_string_one() {
        assert_eq!(DEFER_LENGTH_VALUE, "1");
    }
}
