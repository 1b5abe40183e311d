// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Default ISO-on-TCP (RFC 1006) transport implementation

use crate::error::Error;
use crate::transport::{
    self, Connection, FramedTransport, CONFIRM_CONNECTION, CR_DST_TSAP_OFFSET, CR_SRC_TSAP_OFFSET,
    ISO_CONNECTION_REQUEST_TELEGRAM, ISO_HEADER_SIZE, ISO_TCP_VERSION, PDU_EOT, PDU_TYPE_DC,
    PDU_TYPE_DR, PDU_TYPE_DT,
};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Default TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default isotcp port
pub const ISO_TCP_PORT: u16 = 102;

const MAX_TPDU_LENGTH: usize = 8192;

/// a set of options for the ISO-on-TCP connection
#[derive(Debug, Clone)]
pub struct Options {
    pub host: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
    pub conn_type: Connection,
    /// Our TSAP, `0x0100` unless overridden.
    pub src_tsap: u16,
    /// Peer TSAP; derived from connection type, rack and slot when unset.
    pub dst_tsap: Option<u16>,
    pub connect_timeout: Duration,
}

impl Options {
    pub fn new(host: &str, port: u16, rack: u16, slot: u16) -> Options {
        Options {
            host: host.to_string(),
            port,
            rack,
            slot,
            conn_type: Connection::PG,
            src_tsap: 0x0100,
            dst_tsap: None,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    fn remote_tsap(&self) -> u16 {
        self.dst_tsap
            .unwrap_or(((self.conn_type as u16) << 8) | (self.rack << 5) | self.slot)
    }
}

/// One ISO transport connection over a TCP stream.
///
/// Reception runs through an internal buffer so a `recv` call dropped by
/// the caller's select loop never loses bytes.
pub struct IsoTransport {
    stream: TcpStream,
    rx: BytesMut,
    /// Data TPDU fragments collected until the EOT mark.
    payload: BytesMut,
}

impl IsoTransport {
    /// Dials the peer and performs the COTP connection handshake.
    pub async fn connect(options: Options) -> Result<IsoTransport, Error> {
        let address = format!("{}:{}", options.host, options.port);
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;

        let mut transport = IsoTransport {
            stream,
            rx: BytesMut::with_capacity(4096),
            payload: BytesMut::new(),
        };
        transport.iso_connect(&options).await?;
        debug!(host = %options.host, port = options.port, "iso transport connected");
        Ok(transport)
    }

    async fn iso_connect(&mut self, options: &Options) -> Result<(), Error> {
        let mut msg = ISO_CONNECTION_REQUEST_TELEGRAM.to_vec();
        BigEndian::write_u16(&mut msg[CR_SRC_TSAP_OFFSET..], options.src_tsap);
        BigEndian::write_u16(&mut msg[CR_DST_TSAP_OFFSET..], options.remote_tsap());
        self.stream.write_all(&msg).await?;

        let body = self.next_tpkt().await?.ok_or(Error::Iso {
            reason: "connection closed during handshake".to_string(),
        })?;
        // [length, pdu type, ...] of the COTP header
        if body.len() < 2 || body[1] != CONFIRM_CONNECTION {
            return Err(Error::Iso {
                reason: "peer did not confirm the connection".to_string(),
            });
        }
        Ok(())
    }

    /// A complete TPKT body already sitting in the buffer, if any.
    fn buffered_tpkt(&mut self) -> Result<Option<Bytes>, Error> {
        if self.rx.len() < 4 {
            return Ok(None);
        }
        if self.rx[0] != ISO_TCP_VERSION {
            return Err(Error::Iso {
                reason: format!("bad TPKT version 0x{:02X}", self.rx[0]),
            });
        }
        let length = BigEndian::read_u16(&self.rx[2..]) as usize;
        if !(ISO_HEADER_SIZE..=MAX_TPDU_LENGTH).contains(&length) {
            return Err(Error::Iso {
                reason: format!("TPKT length {} out of range", length),
            });
        }
        if self.rx.len() < length {
            return Ok(None);
        }
        let mut frame = self.rx.split_to(length);
        frame.advance(4);
        Ok(Some(frame.freeze()))
    }

    /// One TPKT-framed message, without the TPKT header. `None` on a
    /// clean close at a frame boundary.
    async fn next_tpkt(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if let Some(body) = self.buffered_tpkt()? {
                return Ok(Some(body));
            }
            let n = self.stream.read_buf(&mut self.rx).await?;
            if n == 0 {
                if self.rx.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Iso {
                    reason: "connection closed mid frame".to_string(),
                });
            }
        }
    }
}

#[async_trait]
impl FramedTransport for IsoTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        let total = frame.len() + ISO_HEADER_SIZE;
        let mut msg = BytesMut::with_capacity(total);
        msg.extend_from_slice(&[ISO_TCP_VERSION, 0]);
        msg.extend_from_slice(&(total as u16).to_be_bytes());
        msg.extend_from_slice(&[2, PDU_TYPE_DT, PDU_EOT]);
        msg.extend_from_slice(&frame);
        self.stream.write_all(&msg).await?;
        trace!(bytes = total, "tpdu sent");
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, Error> {
        // reassemble data TPDUs until one carries the EOT mark
        loop {
            let body = match self.next_tpkt().await? {
                Some(body) => body,
                None => return Ok(None),
            };
            if body.len() < 3 {
                return Err(Error::Iso {
                    reason: "COTP header truncated".to_string(),
                });
            }
            let header_len = body[0] as usize;
            let pdu_type = body[1];
            match pdu_type {
                PDU_TYPE_DT => {
                    let eot = body[2] & PDU_EOT != 0;
                    if body.len() < header_len + 1 {
                        return Err(Error::Iso {
                            reason: "data TPDU shorter than its header".to_string(),
                        });
                    }
                    self.payload.extend_from_slice(&body[header_len + 1..]);
                    if eot {
                        let frame = self.payload.split().freeze();
                        trace!(bytes = frame.len(), "tpdu received");
                        return Ok(Some(frame));
                    }
                }
                PDU_TYPE_DR | PDU_TYPE_DC => return Ok(None),
                other => {
                    return Err(Error::Iso {
                        reason: format!("unexpected COTP PDU type 0x{:02X}", other),
                    })
                }
            }
        }
    }
}

/// The default transport factory used by the endpoint.
pub fn factory(options: Options) -> transport::TransportFactory {
    std::sync::Arc::new(move || {
        let options = options.clone();
        let dial: transport::TransportFuture = Box::pin(async move {
            let transport = IsoTransport::connect(options).await?;
            Ok(Box::new(transport) as transport::BoxedTransport)
        });
        dial
    })
}

#[test]
fn test_remote_tsap_derivation() {
    let options = Options::new("localhost", 102, 0, 2);
    assert_eq!(options.remote_tsap(), 0x0102);

    let mut options = Options::new("localhost", 102, 1, 4);
    assert_eq!(options.remote_tsap(), 0x0124);
    options.dst_tsap = Some(0x4D57);
    assert_eq!(options.remote_tsap(), 0x4D57);
}
