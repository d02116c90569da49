use crate::error::AppError;

use base64::{engine, read};
use std::io::{Cursor, Read};

/// Decode a base64 payload (as returned by the Google TTS REST api) into raw bytes.
pub fn b64_decode_to_buf(enc: &str, buf: &mut Vec<u8>) -> Result<(), AppError> {
    let mut cur = Cursor::new(enc.trim());
    let mut decoder = read::DecoderReader::new(&mut cur, &engine::general_purpose::STANDARD);
    decoder
        .read_to_end(buf)
        .map_err(|e| AppError::Speech(format!("invalid base64 audio: {e}")))?;
    Ok(())
}

#[cfg(test)]
pub fn b64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    engine::general_purpose::STANDARD.encode(bytes)
}

/// Append `params` to `base` as a query string.
pub fn with_query<T: serde::Serialize>(base: &str, params: &T) -> String {
    match serde_urlencoded::to_string(params) {
        Ok(query) if !query.is_empty() => format!("{base}?{query}"),
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_it_encodes() {
        let mut buf = Vec::new();
        b64_decode_to_buf(&b64_encode(b"ID3 mp3 bytes"), &mut buf).unwrap();
        assert_eq!(buf, b"ID3 mp3 bytes");
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = Vec::new();
        assert!(b64_decode_to_buf("%%%not base64%%%", &mut buf).is_err());
    }

    #[test]
    fn builds_query_strings() {
        let url = with_query("/outbound", &[("contact_id", "1"), ("campaign_id", "8")]);
        assert_eq!(url, "/outbound?contact_id=1&campaign_id=8");
        let empty: [(&str, &str); 0] = [];
        assert_eq!(with_query("/x", &empty), "/x");
    }
}
