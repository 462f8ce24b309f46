//! Wire codec for the array-framed socket protocol.
//!
//! Every message is a UTF-8 text frame holding a JSON array, discriminated by
//! element count alone: `[event, payload]` is a server push and
//! `[ref, status, body]` is a reply to an earlier request. Outbound requests
//! are encoded as `[ref, event, payload]`. The codec is stateless; payloads
//! stay as raw JSON slices so the owning table can decode them into the type
//! its caller registered.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// A decoded inbound frame, borrowing payload bytes from the wire text.
#[derive(Debug)]
pub enum Frame<'a> {
    /// Unsolicited server event.
    Push {
        event: String,
        payload: &'a RawValue,
    },
    /// Reply correlated to a prior request by ref.
    Reply {
        reference: u64,
        result: ReplyResult<'a>,
    },
}

/// Outcome carried by a reply frame.
#[derive(Debug)]
pub enum ReplyResult<'a> {
    Ok(&'a RawValue),
    Error { code: u64, reason: String },
}

/// Errors produced while encoding or decoding frames.
///
/// Both variants are scoped to a single frame; the connection stays alive.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is not a well-formed json array: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has {0} elements, expected 2 or 3")]
    MalformedFrame(usize),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplyStatus {
    Ok,
    Error,
}

/// Encodes a request frame as `[ref, event, payload]`.
pub fn encode_request<P>(
    reference: u64,
    event: &str,
    payload: &P,
) -> Result<String, serde_json::Error>
where
    P: Serialize + ?Sized,
{
    serde_json::to_string(&(reference, event, payload))
}

/// Decodes an inbound text frame into a [`Frame`], dispatching on arity.
pub fn decode(text: &str) -> Result<Frame<'_>, CodecError> {
    let elements: Vec<&RawValue> = serde_json::from_str(text)?;

    match elements.as_slice() {
        &[event, payload] => Ok(Frame::Push {
            event: serde_json::from_str(event.get())?,
            payload,
        }),
        &[reference, status, body] => {
            let reference: u64 = serde_json::from_str(reference.get())?;
            let result = match serde_json::from_str(status.get())? {
                ReplyStatus::Ok => ReplyResult::Ok(body),
                ReplyStatus::Error => {
                    let (code, reason): (u64, String) = serde_json::from_str(body.get())?;
                    ReplyResult::Error { code, reason }
                }
            };
            Ok(Frame::Reply { reference, result })
        }
        other => Err(CodecError::MalformedFrame(other.len())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode, encode_request, CodecError, Frame, ReplyResult};

    #[test]
    fn request_encodes_as_three_element_array() {
        let text = encode_request(7, "echo", &json!({"id": "456"})).expect("encode");
        assert_eq!(text, r#"[7,"echo",{"id":"456"}]"#);
    }

    #[test]
    fn two_element_frame_decodes_as_push() {
        let frame = decode(r#"["news",{"id":"1"}]"#).expect("decode");
        match frame {
            Frame::Push { event, payload } => {
                assert_eq!(event, "news");
                assert_eq!(payload.get(), r#"{"id":"1"}"#);
            }
            other => panic!("expected push frame, got {other:?}"),
        }
    }

    #[test]
    fn three_element_frame_decodes_as_ok_reply() {
        let frame = decode(r#"[7,"ok",{"id":"456"}]"#).expect("decode");
        match frame {
            Frame::Reply { reference, result } => {
                assert_eq!(reference, 7);
                match result {
                    ReplyResult::Ok(payload) => assert_eq!(payload.get(), r#"{"id":"456"}"#),
                    other => panic!("expected ok result, got {other:?}"),
                }
            }
            other => panic!("expected reply frame, got {other:?}"),
        }
    }

    #[test]
    fn error_reply_decodes_code_and_reason() {
        let frame = decode(r#"[9,"error",[404,"not found"]]"#).expect("decode");
        match frame {
            Frame::Reply {
                reference,
                result: ReplyResult::Error { code, reason },
            } => {
                assert_eq!(reference, 9);
                assert_eq!(code, 404);
                assert_eq!(reason, "not found");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_arity_is_a_malformed_frame() {
        match decode(r#"[1]"#) {
            Err(CodecError::MalformedFrame(1)) => {}
            other => panic!("expected malformed frame, got {other:?}"),
        }
        match decode(r#"[1,"ok",{},"extra"]"#) {
            Err(CodecError::MalformedFrame(4)) => {}
            other => panic!("expected malformed frame, got {other:?}"),
        }
    }

    #[test]
    fn unknown_status_fails_that_frame_only() {
        assert!(matches!(
            decode(r#"[3,"maybe",{}]"#),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn request_payload_survives_a_reply_round_trip() {
        let payload = json!({"id": "456", "tags": ["a", "b"]});
        let request = encode_request(21, "echo", &payload).expect("encode");

        // A server that echoes the request payload back verbatim.
        let (reference, _event, echoed): (u64, String, serde_json::Value) =
            serde_json::from_str(&request).expect("parse request");
        let reply = format!(r#"[{reference},"ok",{echoed}]"#);

        match decode(&reply).expect("decode reply") {
            Frame::Reply {
                reference,
                result: ReplyResult::Ok(body),
            } => {
                assert_eq!(reference, 21);
                let body: serde_json::Value = serde_json::from_str(body.get()).expect("body");
                assert_eq!(body, payload);
            }
            other => panic!("expected ok reply, got {other:?}"),
        }
    }
}
