//! Binary chunk framing: 4-byte big-endian header length + JSON header + raw payload.

use serde::{Deserialize, Serialize};

/// Header for a binary upload chunk.
///
/// `offset` is signed so a negative value reaches the handler and is
/// rejected as a bad request. `None` means append at end of file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub id: String,
    pub upload_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compute_hash: bool,
}

/// Parses a raw binary WebSocket frame into its header and payload.
///
/// Wire format: `[4 bytes: header_len (big-endian)][header_len bytes: JSON][rest: payload]`
pub fn parse_chunk_frame(data: &[u8]) -> Result<(ChunkHeader, Vec<u8>), ParseError> {
    let Some((len_bytes, rest)) = data.split_first_chunk::<4>() else {
        return Err(ParseError::TooShort);
    };
    let header_len = u32::from_be_bytes(*len_bytes) as usize;

    if rest.len() < header_len {
        return Err(ParseError::HeaderTruncated {
            expected: header_len,
            got: rest.len(),
        });
    }

    let (header_bytes, payload) = rest.split_at(header_len);
    let header: ChunkHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    Ok((header, payload.to_vec()))
}

/// Encodes a chunk frame for sending over WebSocket.
pub fn encode_chunk_frame(header: &ChunkHeader, payload: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = header_json.len() as u32;

    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&header_len.to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Errors from binary frame parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(header: &[u8], payload: &[u8]) -> Vec<u8> {
        let len = header.len() as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(header);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parse_chunk_frame_fields() {
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "msg-1",
            "uploadId": "u-1",
            "offset": 1048576,
            "computeHash": true
        }))
        .unwrap();
        let frame = make_frame(&header, b"binary data here");

        let (header, data) = parse_chunk_frame(&frame).unwrap();
        assert_eq!(header.id, "msg-1");
        assert_eq!(header.upload_id, "u-1");
        assert_eq!(header.offset, Some(1_048_576));
        assert!(header.compute_hash);
        assert_eq!(data, b"binary data here");
    }

    #[test]
    fn append_mode_header() {
        let header = serde_json::to_vec(&serde_json::json!({
            "id": "msg-2",
            "uploadId": "u-1"
        }))
        .unwrap();
        let (header, data) = parse_chunk_frame(&make_frame(&header, &[])).unwrap();
        assert!(header.offset.is_none());
        assert!(!header.compute_hash);
        assert!(data.is_empty());
    }

    #[test]
    fn parse_too_short() {
        let result = parse_chunk_frame(&[0, 0, 0]);
        assert!(matches!(result, Err(ParseError::TooShort)));
    }

    #[test]
    fn parse_header_truncated() {
        // Header says 100 bytes but only has 5.
        let data = [0, 0, 0, 100, 1, 2, 3, 4, 5];
        let result = parse_chunk_frame(&data);
        assert!(matches!(
            result,
            Err(ParseError::HeaderTruncated {
                expected: 100,
                got: 5
            })
        ));
    }

    #[test]
    fn parse_invalid_json() {
        let frame = make_frame(b"not json", b"payload");
        let result = parse_chunk_frame(&frame);
        assert!(matches!(result, Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn encoded_frame_parses_back() {
        let header = ChunkHeader {
            id: "r-1".into(),
            upload_id: "u-1".into(),
            offset: Some(512),
            compute_hash: false,
        };
        let encoded = encode_chunk_frame(&header, b"data").unwrap();
        let header_len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert!(!String::from_utf8_lossy(&encoded[4..4 + header_len]).contains("computeHash"));

        let (parsed, data) = parse_chunk_frame(&encoded).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(data, b"data");
    }
}
