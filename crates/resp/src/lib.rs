//! RESP (REdis Serialization Protocol) support library
//!
//! Implements the incremental RESP2 request tokenizer and reply encoding

mod encoder;
mod tokenizer;

pub use encoder::{
    array_header, bulk_string, error, integer, multi_bulk, null_bulk, simple_string,
};
pub use tokenizer::{
    Request, PROTO_BULK_MAX_SIZE, PROTO_INLINE_MAX_SIZE, PROTO_MAX_MULTI_BULKS,
};

/// Protocol-level tokenizer error, fatal for the connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol error: expect integer")]
    ExpectInteger,
    #[error("Protocol error: too many bulk strings")]
    TooManyBulkStrings,
    #[error("Protocol error: too big inline request")]
    InlineTooBig,
    #[error("Protocol error: expect '$'")]
    ExpectBulkLength,
    #[error("Protocol error: too big bulk string")]
    BulkTooBig,
}
