//! Wire protocol shared with Thorstream brokers.
//!
//! Frames are length-prefixed; requests carry api key, version, correlation id
//! and client id; responses echo the correlation id. Bodies are bincode.

mod codec;
mod messages;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, split_frame, RequestFrame,
    RequestHeader, ResponseFrame, API_VERSION, MAX_FRAME_LEN,
};
pub use messages::*;
