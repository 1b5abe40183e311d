// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Error kinds surfaced by the library

use crate::constant::return_code_text;
use std::io;
use thiserror::Error;

/// Everything that can go wrong between a tag string and the PLC answer.
///
/// Each variant is a stable kind; the fields carry the structured context
/// of the failure. Per-item CPU return codes keep their numeric value in
/// [`Error::ReturnCode`] together with the coordinates of the failing
/// request part.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid address `{address}`: {reason}")]
    ParseAddr { address: String, reason: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("illegal state: {reason}")]
    IllegalState { reason: &'static str },

    #[error("endpoint is not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("request interrupted by connection teardown")]
    Interrupted,

    #[error("item `{name}` needs {size} data bytes but a single PDU holds {max}")]
    ItemTooBig {
        name: String,
        size: usize,
        max: usize,
    },

    #[error("unexpected response: {reason}")]
    UnexpectedResponse { reason: String },

    #[error("PLC error class 0x{class:02X} code 0x{code:02X}")]
    PlcError { class: u8, code: u8 },

    /// A read/write data item answered with a non-OK return code.
    #[error("return code 0x{code:02X} ({text}) for {context}", text = return_code_text(*.code))]
    ReturnCode { code: u8, context: String },

    #[error("ISO transport: {reason}")]
    Iso { reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Kind tag without context, mainly for assertions and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ParseAddr { .. } => "ERR_PARSE_ADDR",
            Error::InvalidArgument { .. } => "ERR_INVALID_ARGUMENT",
            Error::IllegalState { .. } => "ERR_ILLEGAL_STATE",
            Error::NotConnected => "ERR_NOT_CONNECTED",
            Error::Timeout => "ERR_TIMEOUT",
            Error::Interrupted => "ERR_INTERRUPTED",
            Error::ItemTooBig { .. } => "ERR_ITEM_TOO_BIG",
            Error::UnexpectedResponse { .. } => "ERR_UNEXPECTED_RESPONSE",
            Error::PlcError { .. } => "ERR_PLC_ERROR",
            Error::ReturnCode { .. } => "ERR_RETURN_CODE",
            Error::Iso { .. } => "ERR_ISO",
            Error::Io(_) => "ERR_IO",
        }
    }

    /// The per-item CPU return code, when this error carries one.
    pub fn return_code(&self) -> Option<u8> {
        match self {
            Error::ReturnCode { code, .. } => Some(*code),
            _ => None,
        }
    }
}
