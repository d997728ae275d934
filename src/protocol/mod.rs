//! Engine wire protocol.
//!
//! - [`codec`] frames bytes as `command_id | payload_len | payload`
//! - [`commands`] holds the stable command id table
//! - [`payload`] builds outbound payloads and decodes engine replies

pub mod codec;
pub mod commands;
pub mod payload;

pub use codec::{
    DEFAULT_MAX_FRAME_BYTES, HEADER_SIZE, MAX_ENCODABLE_PAYLOAD, decode_from, encode, read_frame,
    write_frame,
};
pub use payload::EngineMessage;
