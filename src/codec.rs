// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Byte-exact parser and serializer for S7 PDUs.
//!
//! One frame of the underlying transport carries exactly one PDU: a 10 or
//! 12 byte header, a function-specific parameter block and an optional
//! data block, all big-endian. Both directions are implemented for every
//! function so tests can stand in for either peer.

use crate::constant::*;
use crate::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One S7-ANY address specification inside a ReadVar/WriteVar parameter
/// block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestItem {
    /// Word-length code (`WL_*`).
    pub transport: u8,
    /// Element count.
    pub length: u16,
    pub db_number: u16,
    pub area: Area,
    pub byte_offset: u32,
    pub bit_offset: u8,
}

impl RequestItem {
    /// 24-bit address field: byte address in the high 21 bits, bit
    /// address in the low 3. Timers and counters address elements
    /// directly.
    fn address_field(&self) -> u32 {
        match self.transport {
            WL_TIMER | WL_COUNTER => self.byte_offset,
            _ => (self.byte_offset << 3) | u32::from(self.bit_offset & 0x07),
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(SPEC_TYPE_VARIABLE);
        buf.put_u8(0x0A); // length of the remaining item bytes
        buf.put_u8(SYNTAX_ID_ANY);
        buf.put_u8(self.transport);
        buf.put_u16(self.length);
        buf.put_u16(self.db_number);
        buf.put_u8(self.area as u8);
        let address = self.address_field();
        buf.put_u8((address >> 16) as u8);
        buf.put_u8((address >> 8) as u8);
        buf.put_u8(address as u8);
    }

    fn parse(buf: &mut Bytes) -> Result<RequestItem, Error> {
        need(buf, 12, "request item")?;
        let spec = buf.get_u8();
        let rest = buf.get_u8();
        let syntax = buf.get_u8();
        if spec != SPEC_TYPE_VARIABLE || rest != 0x0A || syntax != SYNTAX_ID_ANY {
            return Err(Error::UnexpectedResponse {
                reason: format!(
                    "bad item preamble 0x{:02X} 0x{:02X} 0x{:02X}",
                    spec, rest, syntax
                ),
            });
        }
        let transport = buf.get_u8();
        let length = buf.get_u16();
        let db_number = buf.get_u16();
        let area = Area::from_u8(buf.get_u8())?;
        let address =
            (u32::from(buf.get_u8()) << 16) | (u32::from(buf.get_u8()) << 8) | u32::from(buf.get_u8());
        let (byte_offset, bit_offset) = match transport {
            WL_TIMER | WL_COUNTER => (address, 0),
            _ => (address >> 3, (address & 0x07) as u8),
        };
        Ok(RequestItem {
            transport,
            length,
            db_number,
            area,
            byte_offset,
            bit_offset,
        })
    }

    /// Human-readable coordinates for error context.
    pub(crate) fn describe(&self) -> String {
        if self.area.has_db_number() {
            format!(
                "{}{} byte {} len {}",
                self.area.text(),
                self.db_number,
                self.byte_offset,
                self.length
            )
        } else {
            format!("{}{} len {}", self.area.text(), self.byte_offset, self.length)
        }
    }
}

/// One result slot of a ReadVar answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadResult {
    pub code: u8,
    pub transport: u8,
    pub data: Bytes,
}

/// A user-data exchange as sent by us. `continuation` carries the
/// data-unit reference when requesting the next segment of a fragmented
/// answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UserDataRequest {
    pub group: FunctionGroup,
    pub subfunction: u8,
    pub sequence: u8,
    pub continuation: Option<u8>,
    pub payload: Bytes,
}

/// A user-data segment as sent by the PLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UserDataResponse {
    pub group: FunctionGroup,
    pub subfunction: u8,
    pub sequence: u8,
    pub data_unit_ref: u8,
    pub last_data_unit: bool,
    pub error_code: u16,
    pub return_code: u8,
    pub data: Bytes,
}

/// Request side of every function the codec speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobBody {
    Setup {
        max_amq_caller: u16,
        max_amq_callee: u16,
        pdu_size: u16,
    },
    ReadVars(Vec<RequestItem>),
    WriteVars(Vec<RequestItem>, Vec<Bytes>),
    UserData(UserDataRequest),
    StartUpload {
        filename: String,
    },
    Upload {
        upload_id: u32,
    },
    EndUpload {
        upload_id: u32,
        abort: bool,
    },
}

/// Response side of every function the codec speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResponseBody {
    SetupAck {
        max_amq_caller: u16,
        max_amq_callee: u16,
        pdu_size: u16,
    },
    ReadAck(Vec<ReadResult>),
    WriteAck(Vec<u8>),
    UserData(UserDataResponse),
    StartUploadAck {
        upload_id: u32,
        block_length: u32,
    },
    UploadAck {
        more_follows: bool,
        data: Bytes,
    },
    EndUploadAck,
}

/// A parsed incoming PDU. The body is an `Err` when the header carried a
/// nonzero error class/code pair or the payload did not match the
/// function's schema; the PDU reference is available either way so the
/// owning job can be resolved.
#[derive(Debug)]
pub(crate) struct ResponsePdu {
    pub pdu_ref: u16,
    pub body: Result<ResponseBody, Error>,
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), Error> {
    if buf.len() < n {
        return Err(Error::UnexpectedResponse {
            reason: format!("short buffer for {}: {} < {}", what, buf.len(), n),
        });
    }
    Ok(())
}

fn put_header(buf: &mut BytesMut, rosctr: u8, pdu_ref: u16, param_len: usize, data_len: usize) {
    buf.put_u8(PROTOCOL_ID);
    buf.put_u8(rosctr);
    buf.put_u16(0); // redundancy id
    buf.put_u16(pdu_ref);
    buf.put_u16(param_len as u16);
    buf.put_u16(data_len as u16);
}

/// Transport code of the data part belonging to a written item.
fn write_data_transport(word_len: u8) -> u8 {
    match word_len {
        WL_BIT => TS_RES_BIT,
        WL_TIMER | WL_COUNTER => TS_RES_OCTET,
        _ => TS_RES_BYTE,
    }
}

fn put_data_item(buf: &mut BytesMut, code: u8, transport: u8, data: &[u8], last: bool) {
    buf.put_u8(code);
    buf.put_u8(transport);
    if result_transport_in_bytes(transport) {
        buf.put_u16(data.len() as u16);
    } else {
        buf.put_u16((data.len() as u16) << 3);
    }
    buf.put_slice(data);
    if data.len() % 2 == 1 && !last {
        buf.put_u8(0x00);
    }
}

fn parse_data_item(buf: &mut Bytes, last: bool) -> Result<(u8, u8, Bytes), Error> {
    need(buf, 4, "data item header")?;
    let code = buf.get_u8();
    let transport = buf.get_u8();
    let length = buf.get_u16() as usize;
    let byte_len = if result_transport_in_bytes(transport) || transport == TS_RES_NULL {
        length
    } else {
        length >> 3
    };
    need(buf, byte_len, "data item payload")?;
    let data = buf.split_to(byte_len);
    if byte_len % 2 == 1 && !last && !buf.is_empty() {
        buf.advance(1); // padding between odd-length items
    }
    Ok((code, transport, data))
}

// ---- request serialization -------------------------------------------------

pub(crate) fn serialize_request(pdu_ref: u16, body: &JobBody) -> Bytes {
    let mut param = BytesMut::new();
    let mut data = BytesMut::new();
    let rosctr = match body {
        JobBody::Setup {
            max_amq_caller,
            max_amq_callee,
            pdu_size,
        } => {
            param.put_u8(FUNC_SETUP);
            param.put_u8(0x00);
            param.put_u16(*max_amq_caller);
            param.put_u16(*max_amq_callee);
            param.put_u16(*pdu_size);
            ROSCTR_JOB
        }
        JobBody::ReadVars(items) => {
            param.put_u8(FUNC_READ_VAR);
            param.put_u8(items.len() as u8);
            for item in items {
                item.put(&mut param);
            }
            ROSCTR_JOB
        }
        JobBody::WriteVars(items, buffers) => {
            param.put_u8(FUNC_WRITE_VAR);
            param.put_u8(items.len() as u8);
            for item in items {
                item.put(&mut param);
            }
            for (i, buffer) in buffers.iter().enumerate() {
                let transport = write_data_transport(items[i].transport);
                put_data_item(&mut data, 0x00, transport, buffer, i + 1 == buffers.len());
            }
            ROSCTR_JOB
        }
        JobBody::UserData(req) => {
            param.put_slice(&UD_PARAMETER_HEAD);
            match req.continuation {
                None => {
                    param.put_u8(0x04);
                    param.put_u8(UD_METHOD_REQUEST);
                    param.put_u8((UD_TYPE_REQUEST << 4) | req.group as u8);
                    param.put_u8(req.subfunction);
                    param.put_u8(req.sequence);
                    if req.payload.is_empty() {
                        put_data_item(&mut data, RC_NO_DATA, TS_RES_NULL, &[], true);
                    } else {
                        put_data_item(&mut data, RC_DATA_OK, TS_RES_OCTET, &req.payload, true);
                    }
                }
                Some(du_ref) => {
                    param.put_u8(0x08);
                    param.put_u8(UD_METHOD_RESPONSE);
                    param.put_u8((UD_TYPE_REQUEST << 4) | req.group as u8);
                    param.put_u8(req.subfunction);
                    param.put_u8(req.sequence);
                    param.put_u8(du_ref);
                    param.put_u8(0x00);
                    param.put_u16(0x0000);
                    put_data_item(&mut data, RC_NO_DATA, TS_RES_NULL, &[], true);
                }
            }
            ROSCTR_USER_DATA
        }
        JobBody::StartUpload { filename } => {
            param.put_u8(FUNC_START_UPLOAD);
            param.put_u8(0x00);
            param.put_u16(0x0000);
            param.put_u32(0x0000_0000);
            param.put_u8(filename.len() as u8);
            param.put_slice(filename.as_bytes());
            ROSCTR_JOB
        }
        JobBody::Upload { upload_id } => {
            param.put_u8(FUNC_UPLOAD);
            param.put_u8(0x00);
            param.put_u16(0x0000);
            param.put_u32(*upload_id);
            ROSCTR_JOB
        }
        JobBody::EndUpload { upload_id, abort } => {
            param.put_u8(FUNC_END_UPLOAD);
            param.put_u8(if *abort { 0x01 } else { 0x00 });
            param.put_u16(0x0000);
            param.put_u32(*upload_id);
            ROSCTR_JOB
        }
    };

    let mut frame = BytesMut::with_capacity(10 + param.len() + data.len());
    put_header(&mut frame, rosctr, pdu_ref, param.len(), data.len());
    frame.put(param);
    frame.put(data);
    frame.freeze()
}

// ---- response serialization ------------------------------------------------

pub(crate) fn serialize_response(pdu_ref: u16, body: &ResponseBody) -> Bytes {
    let mut param = BytesMut::new();
    let mut data = BytesMut::new();
    let rosctr = match body {
        ResponseBody::SetupAck {
            max_amq_caller,
            max_amq_callee,
            pdu_size,
        } => {
            param.put_u8(FUNC_SETUP);
            param.put_u8(0x00);
            param.put_u16(*max_amq_caller);
            param.put_u16(*max_amq_callee);
            param.put_u16(*pdu_size);
            ROSCTR_ACK_DATA
        }
        ResponseBody::ReadAck(results) => {
            param.put_u8(FUNC_READ_VAR);
            param.put_u8(results.len() as u8);
            for (i, result) in results.iter().enumerate() {
                put_data_item(
                    &mut data,
                    result.code,
                    result.transport,
                    &result.data,
                    i + 1 == results.len(),
                );
            }
            ROSCTR_ACK_DATA
        }
        ResponseBody::WriteAck(codes) => {
            param.put_u8(FUNC_WRITE_VAR);
            param.put_u8(codes.len() as u8);
            data.put_slice(codes);
            ROSCTR_ACK_DATA
        }
        ResponseBody::UserData(res) => {
            param.put_slice(&UD_PARAMETER_HEAD);
            param.put_u8(0x08);
            param.put_u8(UD_METHOD_RESPONSE);
            param.put_u8((UD_TYPE_RESPONSE << 4) | res.group as u8);
            param.put_u8(res.subfunction);
            param.put_u8(res.sequence);
            param.put_u8(res.data_unit_ref);
            param.put_u8(if res.last_data_unit { UD_LAST_DATA_UNIT } else { 0x00 });
            param.put_u16(res.error_code);
            put_data_item(&mut data, res.return_code, TS_RES_OCTET, &res.data, true);
            ROSCTR_USER_DATA
        }
        ResponseBody::StartUploadAck {
            upload_id,
            block_length,
        } => {
            param.put_u8(FUNC_START_UPLOAD);
            param.put_u8(0x00);
            param.put_u16(0x0000);
            param.put_u32(*upload_id);
            let digits = format!("{:07}", block_length);
            param.put_u8(digits.len() as u8);
            param.put_slice(digits.as_bytes());
            ROSCTR_ACK_DATA
        }
        ResponseBody::UploadAck { more_follows, data: chunk } => {
            param.put_u8(FUNC_UPLOAD);
            param.put_u8(if *more_follows { 0x01 } else { 0x00 });
            data.put_u16(chunk.len() as u16);
            data.put_u16(0x00FB);
            data.put_slice(chunk);
            ROSCTR_ACK_DATA
        }
        ResponseBody::EndUploadAck => {
            param.put_u8(FUNC_END_UPLOAD);
            ROSCTR_ACK_DATA
        }
    };

    let header_len = if rosctr == ROSCTR_ACK_DATA { 12 } else { 10 };
    let mut frame = BytesMut::with_capacity(header_len + param.len() + data.len());
    put_header(&mut frame, rosctr, pdu_ref, param.len(), data.len());
    if rosctr == ROSCTR_ACK_DATA {
        frame.put_u16(0x0000); // error class + code
    }
    frame.put(param);
    frame.put(data);
    frame.freeze()
}

/// An AckData frame reporting the given error pair, as controllers answer
/// jobs they reject outright.
pub(crate) fn serialize_plc_error(pdu_ref: u16, class: u8, code: u8) -> Bytes {
    let mut frame = BytesMut::with_capacity(12);
    put_header(&mut frame, ROSCTR_ACK_DATA, pdu_ref, 0, 0);
    frame.put_u8(class);
    frame.put_u8(code);
    frame.freeze()
}

// ---- parsing ---------------------------------------------------------------

struct Header {
    rosctr: u8,
    pdu_ref: u16,
    param_len: usize,
    data_len: usize,
    error: (u8, u8),
}

fn parse_header(buf: &mut Bytes) -> Result<Header, Error> {
    need(buf, 10, "pdu header")?;
    let protocol = buf.get_u8();
    if protocol != PROTOCOL_ID {
        return Err(Error::UnexpectedResponse {
            reason: format!("bad protocol id 0x{:02X}", protocol),
        });
    }
    let rosctr = buf.get_u8();
    buf.advance(2); // redundancy id
    let pdu_ref = buf.get_u16();
    let param_len = buf.get_u16() as usize;
    let data_len = buf.get_u16() as usize;
    let error = if rosctr == ROSCTR_ACK_DATA {
        need(buf, 2, "ack-data error pair")?;
        (buf.get_u8(), buf.get_u8())
    } else {
        (0, 0)
    };
    if buf.len() != param_len + data_len {
        return Err(Error::UnexpectedResponse {
            reason: format!(
                "length fields inconsistent: {} + {} != {}",
                param_len,
                data_len,
                buf.len()
            ),
        });
    }
    Ok(Header {
        rosctr,
        pdu_ref,
        param_len,
        data_len,
        error,
    })
}

/// Parses a frame sent by the PLC. Frame-level garbage (wrong protocol
/// id, short or inconsistent buffer) is an outer error and fatal for the
/// connection; everything else is attributed to the referenced job.
pub(crate) fn parse_response(frame: Bytes) -> Result<ResponsePdu, Error> {
    let mut buf = frame;
    let header = parse_header(&mut buf)?;
    let mut param = buf.split_to(header.param_len);
    let data = buf;

    if header.error != (0, 0) {
        return Ok(ResponsePdu {
            pdu_ref: header.pdu_ref,
            body: Err(Error::PlcError {
                class: header.error.0,
                code: header.error.1,
            }),
        });
    }

    let body = match header.rosctr {
        ROSCTR_ACK_DATA => parse_ack_data(&mut param, data, header.data_len),
        ROSCTR_USER_DATA => parse_user_data(&mut param, data),
        other => Err(Error::UnexpectedResponse {
            reason: format!("unknown ROSCTR 0x{:02X}", other),
        }),
    };
    Ok(ResponsePdu {
        pdu_ref: header.pdu_ref,
        body,
    })
}

fn parse_ack_data(param: &mut Bytes, mut data: Bytes, _data_len: usize) -> Result<ResponseBody, Error> {
    need(param, 1, "ack-data function code")?;
    let function = param.get_u8();
    match function {
        FUNC_SETUP => {
            need(param, 7, "setup parameters")?;
            param.advance(1); // reserved
            Ok(ResponseBody::SetupAck {
                max_amq_caller: param.get_u16(),
                max_amq_callee: param.get_u16(),
                pdu_size: param.get_u16(),
            })
        }
        FUNC_READ_VAR => {
            need(param, 1, "read item count")?;
            let count = param.get_u8() as usize;
            let mut results = Vec::with_capacity(count);
            for i in 0..count {
                let (code, transport, payload) = parse_data_item(&mut data, i + 1 == count)?;
                results.push(ReadResult {
                    code,
                    transport,
                    data: payload,
                });
            }
            Ok(ResponseBody::ReadAck(results))
        }
        FUNC_WRITE_VAR => {
            need(param, 1, "write item count")?;
            let count = param.get_u8() as usize;
            need(&data, count, "write return codes")?;
            Ok(ResponseBody::WriteAck(data.split_to(count).to_vec()))
        }
        FUNC_START_UPLOAD => {
            need(param, 7, "start upload parameters")?;
            param.advance(3); // status + unknown
            let upload_id = param.get_u32();
            need(param, 1, "block length prefix")?;
            let digits = param.get_u8() as usize;
            need(param, digits, "block length digits")?;
            let ascii = param.split_to(digits);
            let block_length = std::str::from_utf8(&ascii)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .ok_or_else(|| Error::UnexpectedResponse {
                    reason: "block length is not a decimal string".to_string(),
                })?;
            Ok(ResponseBody::StartUploadAck {
                upload_id,
                block_length,
            })
        }
        FUNC_UPLOAD => {
            need(param, 1, "upload status")?;
            let more_follows = param.get_u8() == 0x01;
            need(&data, 4, "upload chunk prefix")?;
            let chunk_len = data.get_u16() as usize;
            data.advance(2); // 0x00FB tag
            need(&data, chunk_len, "upload chunk")?;
            Ok(ResponseBody::UploadAck {
                more_follows,
                data: data.split_to(chunk_len),
            })
        }
        FUNC_END_UPLOAD => Ok(ResponseBody::EndUploadAck),
        other => Err(Error::UnexpectedResponse {
            reason: format!("unknown ack-data function 0x{:02X}", other),
        }),
    }
}

fn parse_user_data(param: &mut Bytes, mut data: Bytes) -> Result<ResponseBody, Error> {
    need(param, 12, "user-data parameters")?;
    let head = [param.get_u8(), param.get_u8(), param.get_u8()];
    if head != UD_PARAMETER_HEAD {
        return Err(Error::UnexpectedResponse {
            reason: format!("bad user-data parameter head {:02X?}", head),
        });
    }
    param.advance(1); // remaining parameter length
    let method = param.get_u8();
    if method != UD_METHOD_RESPONSE {
        return Err(Error::UnexpectedResponse {
            reason: format!("unexpected user-data method 0x{:02X}", method),
        });
    }
    let type_group = param.get_u8();
    if type_group >> 4 != UD_TYPE_RESPONSE {
        return Err(Error::UnexpectedResponse {
            reason: format!("unexpected user-data type nibble 0x{:02X}", type_group),
        });
    }
    let group = FunctionGroup::from_u8(type_group & 0x0F)?;
    let subfunction = param.get_u8();
    let sequence = param.get_u8();
    let data_unit_ref = param.get_u8();
    let last_data_unit = param.get_u8() == UD_LAST_DATA_UNIT;
    let error_code = param.get_u16();

    let (return_code, _transport, payload) = parse_data_item(&mut data, true)?;
    Ok(ResponseBody::UserData(UserDataResponse {
        group,
        subfunction,
        sequence,
        data_unit_ref,
        last_data_unit,
        error_code,
        return_code,
        data: payload,
    }))
}

/// Parses a frame sent by a client, the mirror of [`serialize_request`].
/// Exercised by the protocol tests standing in for a controller.
pub(crate) fn parse_request(frame: Bytes) -> Result<(u16, JobBody), Error> {
    let mut buf = frame;
    let header = parse_header(&mut buf)?;
    let mut param = buf.split_to(header.param_len);
    let mut data = buf;

    if header.rosctr == ROSCTR_USER_DATA {
        need(&param, 8, "user-data parameters")?;
        param.advance(3); // parameter head
        let plen = param.get_u8();
        let method = param.get_u8();
        let type_group = param.get_u8();
        let group = FunctionGroup::from_u8(type_group & 0x0F)?;
        let subfunction = param.get_u8();
        let sequence = param.get_u8();
        let continuation = if plen == 0x08 && method == UD_METHOD_RESPONSE {
            need(&param, 1, "data unit reference")?;
            Some(param.get_u8())
        } else {
            None
        };
        let payload = if continuation.is_none() {
            let (_, _, payload) = parse_data_item(&mut data, true)?;
            payload
        } else {
            Bytes::new()
        };
        return Ok((
            header.pdu_ref,
            JobBody::UserData(UserDataRequest {
                group,
                subfunction,
                sequence,
                continuation,
                payload,
            }),
        ));
    }

    if header.rosctr != ROSCTR_JOB {
        return Err(Error::UnexpectedResponse {
            reason: format!("unknown ROSCTR 0x{:02X}", header.rosctr),
        });
    }
    need(&param, 1, "job function code")?;
    let function = param.get_u8();
    let body = match function {
        FUNC_SETUP => {
            need(&param, 7, "setup parameters")?;
            param.advance(1);
            JobBody::Setup {
                max_amq_caller: param.get_u16(),
                max_amq_callee: param.get_u16(),
                pdu_size: param.get_u16(),
            }
        }
        FUNC_READ_VAR | FUNC_WRITE_VAR => {
            need(&param, 1, "item count")?;
            let count = param.get_u8() as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(RequestItem::parse(&mut param)?);
            }
            if function == FUNC_READ_VAR {
                JobBody::ReadVars(items)
            } else {
                let mut buffers = Vec::with_capacity(count);
                for i in 0..count {
                    let (_, _, payload) = parse_data_item(&mut data, i + 1 == count)?;
                    buffers.push(payload);
                }
                JobBody::WriteVars(items, buffers)
            }
        }
        FUNC_START_UPLOAD => {
            need(&param, 8, "start upload parameters")?;
            param.advance(7);
            let name_len = param.get_u8() as usize;
            need(&param, name_len, "upload filename")?;
            let name = param.split_to(name_len);
            JobBody::StartUpload {
                filename: String::from_utf8_lossy(&name).into_owned(),
            }
        }
        FUNC_UPLOAD => {
            need(&param, 7, "upload parameters")?;
            param.advance(3);
            JobBody::Upload {
                upload_id: param.get_u32(),
            }
        }
        FUNC_END_UPLOAD => {
            need(&param, 7, "end upload parameters")?;
            let abort = param.get_u8() == 0x01;
            param.advance(2);
            JobBody::EndUpload {
                upload_id: param.get_u32(),
                abort,
            }
        }
        other => {
            return Err(Error::UnexpectedResponse {
                reason: format!("unknown job function 0x{:02X}", other),
            })
        }
    };
    Ok((header.pdu_ref, body))
}

#[test]
fn test_request_round_trips() {
    let bodies = vec![
        JobBody::Setup {
            max_amq_caller: 8,
            max_amq_callee: 8,
            pdu_size: 480,
        },
        JobBody::ReadVars(vec![
            RequestItem {
                transport: WL_BYTE,
                length: 16,
                db_number: 5,
                area: Area::DataBausteine,
                byte_offset: 12,
                bit_offset: 0,
            },
            RequestItem {
                transport: WL_TIMER,
                length: 1,
                db_number: 0,
                area: Area::Timer,
                byte_offset: 3,
                bit_offset: 0,
            },
        ]),
        JobBody::WriteVars(
            vec![RequestItem {
                transport: WL_BIT,
                length: 1,
                db_number: 1,
                area: Area::DataBausteine,
                byte_offset: 4,
                bit_offset: 5,
            }],
            vec![Bytes::from_static(&[0x01])],
        ),
        JobBody::UserData(UserDataRequest {
            group: FunctionGroup::Cpu,
            subfunction: SUB_CPU_READ_SZL,
            sequence: 0,
            continuation: None,
            payload: Bytes::from_static(&[0x00, 0x11, 0x00, 0x00]),
        }),
        JobBody::UserData(UserDataRequest {
            group: FunctionGroup::Cpu,
            subfunction: SUB_CPU_READ_SZL,
            sequence: 1,
            continuation: Some(1),
            payload: Bytes::new(),
        }),
        JobBody::StartUpload {
            filename: "_0A00001A".to_string(),
        },
        JobBody::Upload { upload_id: 7 },
        JobBody::EndUpload {
            upload_id: 7,
            abort: false,
        },
    ];
    for body in bodies {
        let frame = serialize_request(0x1234, &body);
        let (pdu_ref, parsed) = parse_request(frame).unwrap();
        assert_eq!(pdu_ref, 0x1234);
        assert_eq!(parsed, body);
    }
}

#[test]
fn test_response_round_trips() {
    let bodies = vec![
        ResponseBody::SetupAck {
            max_amq_caller: 2,
            max_amq_callee: 2,
            pdu_size: 240,
        },
        ResponseBody::ReadAck(vec![
            ReadResult {
                code: RC_DATA_OK,
                transport: TS_RES_BYTE,
                data: Bytes::from_static(&[1, 2, 3]),
            },
            ReadResult {
                code: RC_DATA_OK,
                transport: TS_RES_REAL,
                data: Bytes::from_static(&[0x42, 0x56, 0, 0]),
            },
        ]),
        ResponseBody::WriteAck(vec![RC_DATA_OK, 0x05]),
        ResponseBody::UserData(UserDataResponse {
            group: FunctionGroup::Block,
            subfunction: SUB_BLOCK_LIST,
            sequence: 1,
            data_unit_ref: 1,
            last_data_unit: false,
            error_code: 0,
            return_code: RC_DATA_OK,
            data: Bytes::from_static(&[0x30, 0x41, 0x00, 0x02]),
        }),
        ResponseBody::StartUploadAck {
            upload_id: 7,
            block_length: 124,
        },
        ResponseBody::UploadAck {
            more_follows: true,
            data: Bytes::from_static(&[0xAA, 0xBB]),
        },
        ResponseBody::EndUploadAck,
    ];
    for body in bodies {
        let frame = serialize_response(0x00FE, &body);
        let parsed = parse_response(frame).unwrap();
        assert_eq!(parsed.pdu_ref, 0x00FE);
        assert_eq!(parsed.body.unwrap(), body);
    }
}

#[test]
fn test_read_item_bit_length_semantics() {
    // a 3-byte payload under the byte transport has its length counted
    // in bits on the wire
    let frame = serialize_response(
        1,
        &ResponseBody::ReadAck(vec![ReadResult {
            code: RC_DATA_OK,
            transport: TS_RES_BYTE,
            data: Bytes::from_static(&[9, 9, 9]),
        }]),
    );
    // header(12) + param(2) + item header: code, transport, bit length
    assert_eq!(frame[14], RC_DATA_OK);
    assert_eq!(frame[15], TS_RES_BYTE);
    assert_eq!(u16::from_be_bytes([frame[16], frame[17]]), 24);
}

#[test]
fn test_plc_error_header() {
    let frame = serialize_plc_error(9, 0x81, 0x04);
    let parsed = parse_response(frame).unwrap();
    assert_eq!(parsed.pdu_ref, 9);
    match parsed.body {
        Err(Error::PlcError { class, code }) => {
            assert_eq!(class, 0x81);
            assert_eq!(code, 0x04);
        }
        other => panic!("expected PlcError, got {:?}", other),
    }
}

#[test]
fn test_bad_frames_rejected() {
    // short buffer
    assert!(parse_response(Bytes::from_static(&[0x32, 0x03])).is_err());
    // bad protocol id
    let mut frame = BytesMut::new();
    put_header(&mut frame, ROSCTR_ACK_DATA, 1, 0, 0);
    frame.put_u16(0);
    let mut bad = frame.to_vec();
    bad[0] = 0x31;
    assert!(parse_response(Bytes::from(bad)).is_err());
    // inconsistent length fields
    let mut frame = BytesMut::new();
    put_header(&mut frame, ROSCTR_ACK_DATA, 1, 4, 0);
    frame.put_u16(0);
    assert!(parse_response(frame.freeze()).is_err());
    // unknown rosctr
    let mut frame = BytesMut::new();
    put_header(&mut frame, 0x09, 1, 0, 0);
    assert!(parse_response(frame.freeze()).unwrap().body.is_err());
}
