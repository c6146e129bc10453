//! The per-frame compression envelope.
//!
//! Every binary frame from the server starts with a one-byte tag naming the
//! compression applied to the rest of the frame. Client -> server frames are
//! never compressed and carry no envelope.

use std::io::Read;

use stdb_dyn_sats::DecodeError;
use thiserror::Error;

use crate::websocket::ServerMessage;

/// The compression schemes a client can ask the server to reply with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Brotli,
    #[default]
    Gzip,
}

impl Compression {
    /// The value for the `compression` query parameter of the subscribe URL.
    pub fn query_value(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Brotli => "brotli",
            Compression::Gzip => "gzip",
        }
    }
}

pub const SERVER_MSG_COMPRESSION_TAG_NONE: u8 = 0;
pub const SERVER_MSG_COMPRESSION_TAG_BROTLI: u8 = 1;
pub const SERVER_MSG_COMPRESSION_TAG_GZIP: u8 = 2;

/// A fault in the framing around a server message.
///
/// None of these are fatal to the connection: the transport logs the error,
/// drops the frame and keeps reading.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown compression tag {0:#04x}")]
    UnknownCompression(u8),
    #[error("failed to decompress frame: {0}")]
    Decompress(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Strips the envelope byte from `frame` and undoes the named compression.
pub fn decompress_frame(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let (&tag, body) = frame.split_first().ok_or(FrameError::Empty)?;
    match tag {
        SERVER_MSG_COMPRESSION_TAG_NONE => Ok(body.to_vec()),
        SERVER_MSG_COMPRESSION_TAG_BROTLI => {
            let mut out = Vec::new();
            brotli::Decompressor::new(body, 4096).read_to_end(&mut out)?;
            Ok(out)
        }
        SERVER_MSG_COMPRESSION_TAG_GZIP => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body).read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(FrameError::UnknownCompression(other)),
    }
}

/// Decodes one enveloped server frame into a [`ServerMessage`].
pub fn decode_frame(frame: &[u8]) -> Result<ServerMessage, FrameError> {
    let payload = decompress_frame(frame)?;
    Ok(ServerMessage::decode(&payload)?)
}
