//! Protocol module - RPC envelopes and socket framing.
//!
//! This module implements the message layer above the codec:
//! - call envelopes and reply decoding (single, batched, function list)
//! - 4/8-byte socket frame headers
//! - frame buffer for accumulating partial reads

mod envelope;
mod frame;
mod frame_buffer;
mod wire_format;

pub use envelope::{
    decode_batch_reply, decode_functions, decode_reply, encode_call, finish_request,
    function_names, BatchItemMode, Response, ResultMode, FUNCTIONS_REQUEST,
};
pub use frame::{build_frame, full_duplex_frame, half_duplex_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    next_request_id, validate_length, Header, ABSOLUTE_MAX_PAYLOAD_SIZE,
    DEFAULT_MAX_PAYLOAD_SIZE, FULL_DUPLEX_FLAG, FULL_DUPLEX_HEADER_SIZE,
    HALF_DUPLEX_HEADER_SIZE, LENGTH_SIZE, MAX_HEADER_SIZE, MAX_REQUEST_ID,
};
