// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Transport contract between the connection and the wire

use crate::error::Error;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Client Connection Type
/// 16 possible connections limited by the hardware
/// The types are defined from the highest to lowest priority
/// The basic connections are the first which would be closed
/// if there aren't enough resources
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connect to the PLC programming console (Programmiergeräte). German for programming device.
    PG = 1,
    /// Connect to the PLC Siemens HMI panel
    OP = 2,
    /// Basic connection for generic data transfer connection
    /// 14 Basic connections
    Basic = 3,
}

/// A bidirectional, message-framed byte stream: each [`send`] delivers
/// exactly one TPDU to the peer, each [`recv`] yields exactly one TPDU's
/// payload. `recv` resolves to `None` once the peer has closed the
/// stream in an orderly fashion.
///
/// The connection owns its transport exclusively; implementations never
/// see concurrent calls. `recv` is polled inside a select loop and must
/// be cancellation safe: a call dropped before completion must not
/// discard bytes of a partially received message.
///
/// [`send`]: FramedTransport::send
/// [`recv`]: FramedTransport::recv
#[async_trait]
pub trait FramedTransport: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error>;
    async fn recv(&mut self) -> Result<Option<Bytes>, Error>;
}

pub type BoxedTransport = Box<dyn FramedTransport>;

/// Future returned by a transport factory.
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<BoxedTransport, Error>> + Send>>;

/// Builds one fresh transport per (re)connection attempt. The default
/// factory dials ISO-on-TCP, see [`crate::tcp`].
pub type TransportFactory = Arc<dyn Fn() -> TransportFuture + Send + Sync>;

/// response from the plc that the connection has been confirmed
pub(crate) const CONFIRM_CONNECTION: u8 = 0xD0;

pub(crate) const ISO_TCP_VERSION: u8 = 3; // RFC 1006

// COTP PDU types (code + credit)
pub(crate) const PDU_TYPE_DT: u8 = 0xF0; // Data transfer
pub(crate) const PDU_TYPE_DR: u8 = 0x80; // Disconnect request
pub(crate) const PDU_TYPE_DC: u8 = 0xC0; // Disconnect confirm

/// EOT bit of a data TPDU: this packet completes the message.
pub(crate) const PDU_EOT: u8 = 0x80;

/// ISO Connection Request telegram (contains also ISO Header and COTP Header)
/// TPKT (RFC1006 Header)
pub(crate) const ISO_CONNECTION_REQUEST_TELEGRAM: [u8; 22] = [
    3,  // RFC 1006 ID (3)
    0,  // Reserved, always 0
    0,  // High part of packet lenght (entire frame, payload and TPDU included)
    22, // Low part of packet lenght (entire frame, payload and TPDU included)
    // COTP (ISO 8073 Header)
    17,  // PDU Size Length
    224, // CR - Connection Request ID
    0,   // Dst Reference HI
    0,   // Dst Reference LO
    0,   // Src Reference HI
    1,   // Src Reference LO
    0,   // Class + Options Flags
    192, // PDU Max Length ID
    1,   // PDU Max Length HI
    10,  // PDU Max Length LO
    193, // Src TSAP Identifier
    2,   // Src TSAP Length (2 bytes)
    1,   // Src TSAP HI (will be overwritten)
    0,   // Src TSAP LO (will be overwritten)
    194, // Dst TSAP Identifier
    2,   // Dst TSAP Length (2 bytes)
    1,   // Dst TSAP HI (will be overwritten)
    2,
]; // Dst TSAP LO (will be overwritten)

// Offsets of the TSAP fields inside the connection request telegram
pub(crate) const CR_SRC_TSAP_OFFSET: usize = 16;
pub(crate) const CR_DST_TSAP_OFFSET: usize = 20;

/// TPKT header plus the 3-byte COTP data header in front of every frame.
pub(crate) const ISO_HEADER_SIZE: usize = 7;
