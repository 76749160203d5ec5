/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use serde_json::Value;
use thiserror::Error;

/// Size of the length prefix at the start of every frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Failures encoding or decoding an event-buffer frame.
#[derive(Debug, Error)]
pub enum WireError {
    /// The encoded frame does not fit the fixed-size buffer it is
    /// destined for.
    #[error("encoded frame is {frame} bytes but the target buffer holds {capacity}")]
    FrameTooLarge {
        /// Total size of the frame, header included.
        frame: usize,
        /// Capacity of the target buffer.
        capacity: usize,
    },
    /// The buffer ends before the length prefix is complete.
    #[error("frame header is truncated ({0} of {FRAME_HEADER_SIZE} bytes)")]
    TruncatedHeader(usize),
    /// The length prefix promises more payload bytes than the buffer holds.
    #[error("frame body is truncated: header promises {expected} bytes, buffer holds {available}")]
    TruncatedBody {
        /// Payload length from the header.
        expected: usize,
        /// Payload bytes actually present.
        available: usize,
    },
    /// The payload is not valid UTF-8 JSON.
    #[error("frame payload is not valid JSON: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Encode `value` as a length-prefixed UTF-8 JSON frame.
///
/// The frame is a little-endian `u32` payload length followed by the
/// JSON text. `capacity` is the size of the fixed buffer the frame will
/// be written into; a frame that does not fit is rejected here rather
/// than truncated on the way into guest memory.
pub fn encode_frame(value: &Value, capacity: usize) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(value)?;
    let total = FRAME_HEADER_SIZE + body.len();
    if total > capacity {
        return Err(WireError::FrameTooLarge {
            frame: total,
            capacity,
        });
    }
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a length-prefixed JSON frame from the front of `buf`.
///
/// Bytes past the encoded length are ignored, so a whole fixed-size
/// buffer can be passed in without trimming it first.
pub fn decode_frame(buf: &[u8]) -> Result<Value, WireError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(WireError::TruncatedHeader(buf.len()));
    }
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
    let expected = u32::from_le_bytes(header) as usize;
    let body = &buf[FRAME_HEADER_SIZE..];
    if body.len() < expected {
        return Err(WireError::TruncatedBody {
            expected,
            available: body.len(),
        });
    }
    Ok(serde_json::from_slice(&body[..expected])?)
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;
    use serde_json::json;

    use super::*;

    #[test]
    fn round_trips_a_nested_value() {
        let value = json!({"a": [1, 2.5, null], "b": {"nested": "päivää"}});
        let frame = encode_frame(&value, 1024).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), value);
    }

    #[test]
    fn ignores_trailing_buffer_padding() {
        let value = json!([true, false]);
        let mut frame = encode_frame(&value, 1024).unwrap();
        frame.resize(256, 0xA5);
        assert_eq!(decode_frame(&frame).unwrap(), value);
    }

    #[test]
    fn rejects_a_frame_larger_than_the_buffer() {
        let value = json!("x".repeat(100));
        match encode_frame(&value, 32) {
            Err(WireError::FrameTooLarge { frame, capacity }) => {
                assert!(frame > capacity);
                assert_eq!(capacity, 32);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn rejects_a_truncated_header() {
        assert!(matches!(
            decode_frame(&[1, 0]),
            Err(WireError::TruncatedHeader(2))
        ));
    }

    #[test]
    fn rejects_a_truncated_body() {
        // Header promises 100 bytes; only 2 follow.
        let mut frame = 100u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"{}");
        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::TruncatedBody {
                expected: 100,
                available: 2
            })
        ));
    }

    #[test]
    fn rejects_malformed_payload() {
        let mut frame = 2u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"{!");
        assert!(matches!(
            decode_frame(&frame),
            Err(WireError::MalformedPayload(_))
        ));
    }

    quickcheck! {
        fn any_string_survives_framing(s: String) -> bool {
            let value = json!(s);
            let frame = encode_frame(&value, FRAME_HEADER_SIZE + s.len() * 6 + 16).unwrap();
            decode_frame(&frame).unwrap() == value
        }

        fn frame_size_is_header_plus_body(n: u32) -> bool {
            let value = json!(n);
            let frame = encode_frame(&value, 64).unwrap();
            frame.len() == FRAME_HEADER_SIZE + serde_json::to_vec(&value).unwrap().len()
        }
    }
}
