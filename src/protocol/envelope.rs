//! RPC envelopes.
//!
//! A request is one or more call envelopes followed by a single `z`:
//! ```text
//! C s4"echo" a1{s5"hello"} [t]   C s3"add" a2{12}   z
//! ```
//! A reply repeats `R value [A args]` or `E message` per call, in request
//! order, and ends with `z`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::codec::tags::*;
use crate::codec::{Reader, Value, Writer};
use crate::error::{Error, Result};

/// Request asking the server for its procedure list.
pub const FUNCTIONS_REQUEST: &[u8] = &[TAG_END];

/// How a call's result is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultMode {
    /// Decoded into a [`Value`].
    #[default]
    Normal,
    /// The result's own encoding, undecoded.
    Serialized,
    /// The whole reply without its trailing `z`.
    Raw,
    /// The whole reply.
    RawWithEndTag,
}

impl ResultMode {
    /// Whether the reply is handed over without decoding.
    pub fn is_raw(self) -> bool {
        matches!(self, ResultMode::Raw | ResultMode::RawWithEndTag)
    }
}

/// Decoded reply to one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Result value; `Value::Bytes` in the non-normal modes.
    pub result: Value,
    /// Arguments echoed back by a by-reference call.
    pub args: Option<Vec<Value>>,
}

/// Encode one call envelope, without the request terminator.
///
/// Each envelope gets its own writer, so references never span calls.
pub fn encode_call(
    name: &str,
    args: &[Value],
    byref: bool,
    simple: bool,
    binary: bool,
) -> Result<Bytes> {
    let mut writer = Writer::new(simple, binary);
    writer.write_tag(TAG_CALL);
    writer.write_string(name);
    if !args.is_empty() || byref {
        writer.reset();
        writer.write_list(args)?;
        if byref {
            writer.write_tag(TAG_TRUE);
        }
    }
    Ok(writer.take())
}

/// Join call envelopes into one request.
pub fn finish_request<I>(calls: I) -> Bytes
where
    I: IntoIterator<Item = Bytes>,
{
    let mut buf = BytesMut::new();
    for call in calls {
        buf.extend_from_slice(&call);
    }
    buf.put_u8(TAG_END);
    buf.freeze()
}

pub(crate) fn wrong_response(response: &[u8]) -> Error {
    Error::Protocol(format!(
        "Wrong Response:\r\n{}",
        String::from_utf8_lossy(response)
    ))
}

/// Decode the reply to a single call.
pub fn decode_reply(
    response: &[u8],
    mode: ResultMode,
    use_harmony_map: bool,
    binary: bool,
) -> Result<Response> {
    match mode {
        ResultMode::RawWithEndTag => {
            return Ok(Response {
                result: Value::Bytes(Bytes::copy_from_slice(response)),
                args: None,
            })
        }
        ResultMode::Raw => {
            let end = response.len().saturating_sub(1);
            return Ok(Response {
                result: Value::Bytes(Bytes::copy_from_slice(&response[..end])),
                args: None,
            });
        }
        _ => {}
    }

    let mut reader = Reader::new(response, false, use_harmony_map, binary);
    let mut result = Value::Null;
    let mut args = None;
    let mut tag = reader.next_tag();

    if tag == Some(TAG_RESULT) {
        result = if mode == ResultMode::Serialized {
            Value::Bytes(reader.read_raw()?)
        } else {
            reader.unserialize()?
        };
        tag = reader.next_tag();
        if tag == Some(TAG_ARGUMENT) {
            reader.reset();
            args = reader.read_list()?.to_vec();
            tag = reader.next_tag();
        }
    } else if tag == Some(TAG_ERROR) {
        let message = reader.read_string()?;
        if reader.next_tag() != Some(TAG_END) {
            return Err(wrong_response(response));
        }
        return Err(Error::Server(message));
    }

    if tag != Some(TAG_END) {
        return Err(wrong_response(response));
    }
    Ok(Response { result, args })
}

/// Per-call decoding options inside a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchItemMode {
    /// Result mode of the call.
    pub mode: ResultMode,
    /// Map decoding of the call.
    pub use_harmony_map: bool,
}

/// Decode a batched reply, one entry per item in request order.
///
/// A server error for one call only fails that entry; a malformed reply
/// fails the whole batch.
pub fn decode_batch_reply(
    response: &[u8],
    items: &[BatchItemMode],
    binary: bool,
) -> Result<Vec<Result<Response>>> {
    let mut reader = Reader::new(response, false, false, binary);
    let mut replies = Vec::with_capacity(items.len());
    let mut tag = reader.next_tag();

    while tag != Some(TAG_END) {
        let item = items
            .get(replies.len())
            .copied()
            .ok_or_else(|| wrong_response(response))?;
        let mut raw = BytesMut::new();
        let mut reply = Response {
            result: Value::Null,
            args: None,
        };
        let mut error = None;

        match tag {
            Some(TAG_RESULT) => {
                if item.mode == ResultMode::Serialized {
                    reply.result = Value::Bytes(reader.read_raw()?);
                } else if item.mode.is_raw() {
                    raw.put_u8(TAG_RESULT);
                    raw.extend_from_slice(&reader.read_raw()?);
                } else {
                    reader.set_use_harmony_map(item.use_harmony_map);
                    reader.reset();
                    reply.result = reader.unserialize()?;
                }
                tag = reader.next_tag();
                if tag == Some(TAG_ARGUMENT) {
                    if item.mode.is_raw() {
                        raw.put_u8(TAG_ARGUMENT);
                        raw.extend_from_slice(&reader.read_raw()?);
                    } else {
                        reader.reset();
                        reply.args = reader.read_list()?.to_vec();
                    }
                    tag = reader.next_tag();
                }
            }
            Some(TAG_ERROR) => {
                if item.mode.is_raw() {
                    raw.put_u8(TAG_ERROR);
                    raw.extend_from_slice(&reader.read_raw()?);
                } else {
                    reader.reset();
                    error = Some(Error::Server(reader.read_string()?));
                }
                tag = reader.next_tag();
            }
            _ => return Err(wrong_response(response)),
        }

        if !matches!(tag, Some(TAG_END) | Some(TAG_RESULT) | Some(TAG_ERROR)) {
            return Err(wrong_response(response));
        }

        if item.mode.is_raw() {
            if item.mode == ResultMode::RawWithEndTag {
                raw.put_u8(TAG_END);
            }
            reply.result = Value::Bytes(raw.freeze());
        }
        replies.push(match error {
            Some(e) => Err(e),
            None => Ok(reply),
        });
    }
    Ok(replies)
}

/// Decode the reply to [`FUNCTIONS_REQUEST`].
pub fn decode_functions(response: &[u8]) -> Result<Vec<Value>> {
    let mut reader = Reader::new(response, true, false, false);
    match reader.next_tag() {
        Some(TAG_ERROR) => Err(Error::Server(reader.read_string()?)),
        Some(TAG_FUNCTIONS) => {
            let list = reader.read_list()?.to_vec().unwrap_or_default();
            reader.check_tag(TAG_END)?;
            Ok(list)
        }
        _ => Err(wrong_response(response)),
    }
}

/// Flatten a published procedure list into callable names.
///
/// Plain strings are names; a map `{ns: [m1, {sub: [m2]}]}` publishes
/// `ns_m1` and `ns_sub_m2`.
pub fn function_names(functions: &[Value]) -> Vec<String> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(name) => out.push(format!("{prefix}{name}")),
            Value::List(items) => {
                for item in items.read_recursive().iter() {
                    walk(prefix, item, out);
                }
            }
            Value::Map(entries) => {
                for (key, methods) in entries.read_recursive().iter() {
                    if let Value::String(ns) = key {
                        walk(&format!("{prefix}{ns}_"), methods, out);
                    }
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    for f in functions {
        walk("", f, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_call_without_args() {
        let call = encode_call("ping", &[], false, false, false).unwrap();
        assert_eq!(&call[..], b"Cs4\"ping\"");
    }

    #[test]
    fn test_encode_call_with_args_and_byref() {
        let call = encode_call("echo", &[Value::from("echo")], true, false, false).unwrap();
        // The reset before the argument list forgets the procedure name.
        assert_eq!(&call[..], b"Cs4\"echo\"a1{s4\"echo\"}t");
    }

    #[test]
    fn test_batch_request_has_one_terminator() {
        let a = encode_call("a", &[Value::from(1)], false, false, false).unwrap();
        let b = encode_call("b", &[], false, false, false).unwrap();
        let request = finish_request([a, b]);
        assert_eq!(&request[..], b"Cs1\"a\"a1{1}Cs1\"b\"z");
    }

    #[test]
    fn test_decode_reply_modes() {
        let response = b"Rs5\"hello\"z";
        let reply = decode_reply(response, ResultMode::Normal, false, false).unwrap();
        assert_eq!(reply.result, Value::from("hello"));

        let reply = decode_reply(response, ResultMode::Serialized, false, false).unwrap();
        assert_eq!(reply.result, Value::Bytes(Bytes::from_static(b"s5\"hello\"")));

        let reply = decode_reply(response, ResultMode::Raw, false, false).unwrap();
        assert_eq!(reply.result, Value::Bytes(Bytes::from_static(b"Rs5\"hello\"")));

        let reply = decode_reply(response, ResultMode::RawWithEndTag, false, false).unwrap();
        assert_eq!(reply.result, Value::Bytes(Bytes::copy_from_slice(response)));
    }

    #[test]
    fn test_decode_reply_with_arguments() {
        let reply = decode_reply(b"R1Aa2{23}z", ResultMode::Normal, false, false).unwrap();
        assert_eq!(reply.result, Value::from(1));
        assert_eq!(reply.args, Some(vec![Value::from(2), Value::from(3)]));
    }

    #[test]
    fn test_decode_reply_server_error() {
        let err = decode_reply(b"Es4\"oops\"z", ResultMode::Normal, false, false).unwrap_err();
        assert!(matches!(&err, Error::Server(m) if m == "oops"));
    }

    #[test]
    fn test_decode_reply_missing_end() {
        let err = decode_reply(b"R1", ResultMode::Normal, false, false).unwrap_err();
        assert_eq!(err.to_string(), "Wrong Response:\r\nR1");
    }

    #[test]
    fn test_decode_batch_reply_in_order_with_error() {
        let items = [BatchItemMode::default(); 3];
        let replies =
            decode_batch_reply(b"R1Es4\"fail\"Rs2\"ok\"z", &items, false).unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].as_ref().unwrap().result, Value::from(1));
        assert!(matches!(&replies[1], Err(Error::Server(m)) if m == "fail"));
        assert_eq!(replies[2].as_ref().unwrap().result, Value::from("ok"));
    }

    #[test]
    fn test_decode_batch_reply_raw_items() {
        let items = [
            BatchItemMode {
                mode: ResultMode::Raw,
                use_harmony_map: false,
            },
            BatchItemMode {
                mode: ResultMode::RawWithEndTag,
                use_harmony_map: false,
            },
        ];
        let replies = decode_batch_reply(b"R1Aa{}Es1\"x\"z", &items, false).unwrap();
        assert_eq!(
            replies[0].as_ref().unwrap().result,
            Value::Bytes(Bytes::from_static(b"R1Aa{}"))
        );
        assert_eq!(
            replies[1].as_ref().unwrap().result,
            Value::Bytes(Bytes::from_static(b"Es1\"x\"z"))
        );
    }

    #[test]
    fn test_decode_batch_reply_rejects_garbage_between_items() {
        let items = [BatchItemMode::default(); 2];
        assert!(decode_batch_reply(b"R1x", &items, false).is_err());
    }

    #[test]
    fn test_decode_functions() {
        let list = decode_functions(b"Fa2{s5\"hello\"m1{s4\"user\"a2{s3\"get\"s3\"set\"}}}z").unwrap();
        assert_eq!(
            function_names(&list),
            vec!["hello", "user_get", "user_set"]
        );

        let err = decode_functions(b"Es6\"denied\"z").unwrap_err();
        assert!(matches!(err, Error::Server(_)));
        assert!(decode_functions(b"R1z").is_err());
    }
}
