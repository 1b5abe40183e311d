// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! One typed PLC variable: parsed address, scratch buffer and the
//! big-endian byte codecs between the two

use crate::address::{Address, DataType};
use crate::codec::RequestItem;
use crate::error::Error;
use byteorder::{BigEndian, ByteOrder};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

/// A decoded variable value. Arrays of a type decode to [`Value::Array`]
/// of the element variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Char(char),
    Word(u16),
    Int(i16),
    DWord(u32),
    DInt(i32),
    Real(f32),
    String(String),
    /// Timer value in seconds, decoded from S5TIME.
    Timer(f32),
    /// Counter value, decoded from BCD.
    Counter(u16),
    DateTime(NaiveDateTime),
    /// Duration in milliseconds.
    Time(i32),
    Array(Vec<Value>),
}

/// Where an item's bytes live inside a response window: offset in the
/// response buffer, offset in the item buffer, byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CopyDescriptor {
    pub source: usize,
    pub dest: usize,
    pub count: usize,
}

/// A named variable inside an item group. Owns the scratch buffer the
/// grouped reads scatter into, so repeated polls do not reallocate.
#[derive(Debug, Clone)]
pub struct Item {
    name: String,
    address: Address,
    buffer: Vec<u8>,
}

impl Item {
    pub(crate) fn new(name: String, address: Address) -> Item {
        let len = address.byte_length();
        Item {
            name,
            address,
            buffer: vec![0u8; len],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn byte_length(&self) -> usize {
        self.buffer.len()
    }

    /// Part descriptor for a one-item read.
    pub(crate) fn read_request(&self) -> RequestItem {
        let address = &self.address;
        let length = match address.data_type {
            DataType::Timer | DataType::Counter => address.length,
            _ => address.byte_length() as u16,
        };
        RequestItem {
            transport: address.read_transport(),
            length,
            db_number: address.db_number,
            area: address.area,
            byte_offset: address.byte_offset,
            bit_offset: 0,
        }
    }

    /// Item descriptor for a write of this variable.
    pub(crate) fn write_request(&self) -> RequestItem {
        let address = &self.address;
        let length = match address.data_type {
            DataType::Bool => address.length,
            DataType::Timer | DataType::Counter => address.length,
            _ => address.write_byte_length() as u16,
        };
        RequestItem {
            transport: address.write_transport(),
            length,
            db_number: address.db_number,
            area: address.area,
            byte_offset: address.byte_offset,
            bit_offset: address.bit_offset,
        }
    }

    /// Scatter a slice of response bytes into the scratch buffer.
    pub(crate) fn copy_from(&mut self, response: &[u8], copy: CopyDescriptor) {
        self.buffer[copy.dest..copy.dest + copy.count]
            .copy_from_slice(&response[copy.source..copy.source + copy.count]);
    }

    /// Locates this item's bytes within the byte window
    /// `[part_address, part_address + part_length)` of its area/db.
    /// Returns nothing when the window misses the item entirely.
    pub(crate) fn copy_offsets(&self, part_address: u32, part_length: usize) -> Option<CopyDescriptor> {
        let item_start = self.address.byte_offset as usize;
        let item_end = item_start + self.byte_length();
        let part_start = part_address as usize;
        let part_end = part_start + part_length;

        let start = item_start.max(part_start);
        let end = item_end.min(part_end);
        if start >= end {
            return None;
        }
        Some(CopyDescriptor {
            source: start - part_start,
            dest: start - item_start,
            count: end - start,
        })
    }

    /// Decode the scratch buffer into the typed value.
    pub(crate) fn update_value(&self) -> Result<Value, Error> {
        let address = &self.address;
        let mut values = Vec::with_capacity(address.length as usize);
        for i in 0..address.length as usize {
            values.push(self.decode_element(i)?);
        }
        if address.length == 1 {
            Ok(values.pop().expect("length is at least 1"))
        } else {
            Ok(Value::Array(values))
        }
    }

    fn decode_element(&self, index: usize) -> Result<Value, Error> {
        let address = &self.address;
        let buf = &self.buffer;
        if address.data_type == DataType::Bool {
            let bit = address.bit_offset as usize + index;
            let byte = buf[bit / 8];
            return Ok(Value::Bool(byte & (1 << (bit % 8)) != 0));
        }

        let offset = index * address.element_length;
        let b = &buf[offset..offset + address.element_length];
        let value = match address.data_type {
            DataType::Bool => unreachable!(),
            DataType::Byte => Value::Byte(b[0]),
            DataType::Char => Value::Char(b[0] as char),
            DataType::Word => Value::Word(BigEndian::read_u16(b)),
            DataType::Int => Value::Int(BigEndian::read_i16(b)),
            DataType::DWord => Value::DWord(BigEndian::read_u32(b)),
            DataType::DInt => Value::DInt(BigEndian::read_i32(b)),
            DataType::Real => Value::Real(BigEndian::read_f32(b)),
            DataType::String => {
                let capacity = address.element_length - 2;
                let current = (b[1] as usize).min(capacity);
                Value::String(b[2..2 + current].iter().map(|&c| c as char).collect())
            }
            DataType::Timer => Value::Timer(decode_s5time(BigEndian::read_u16(b))?),
            DataType::Counter => Value::Counter(decode_bcd16(BigEndian::read_u16(b))?),
            DataType::DateTime => Value::DateTime(decode_date_and_time(b)?),
            DataType::Time => Value::Time(BigEndian::read_i32(b)),
        };
        Ok(value)
    }

    /// Encode a value (scalar or array) into a fresh write buffer sized
    /// by the filled byte length.
    pub(crate) fn write_buffer(&self, value: &Value) -> Result<Vec<u8>, Error> {
        let address = &self.address;
        let elements: Vec<&Value> = match value {
            Value::Array(values) => values.iter().collect(),
            scalar => vec![scalar],
        };
        if elements.len() != address.length as usize {
            return Err(Error::InvalidArgument {
                reason: format!(
                    "item `{}` holds {} elements, value has {}",
                    self.name,
                    address.length,
                    elements.len()
                ),
            });
        }

        let mut buf = vec![0u8; self.address.byte_length_with_fill()];
        for (i, element) in elements.iter().enumerate() {
            self.encode_element(&mut buf, i, element)?;
        }
        Ok(buf)
    }

    fn encode_element(&self, buf: &mut [u8], index: usize, value: &Value) -> Result<(), Error> {
        let address = &self.address;
        let type_mismatch = || Error::InvalidArgument {
            reason: format!(
                "value {:?} does not fit item `{}` of type {:?}",
                value, self.name, address.data_type
            ),
        };

        // bits travel one byte per element through the bit transport
        if address.data_type == DataType::Bool {
            match value {
                Value::Bool(v) => buf[index] = *v as u8,
                _ => return Err(type_mismatch()),
            }
            return Ok(());
        }

        let offset = index * address.element_length;
        let b = &mut buf[offset..offset + address.element_length];
        match (address.data_type, value) {
            (DataType::Byte, Value::Byte(v)) => b[0] = *v,
            (DataType::Char, Value::Char(v)) => b[0] = *v as u8,
            (DataType::Word, Value::Word(v)) => BigEndian::write_u16(b, *v),
            (DataType::Int, Value::Int(v)) => BigEndian::write_i16(b, *v),
            (DataType::DWord, Value::DWord(v)) => BigEndian::write_u32(b, *v),
            (DataType::DInt, Value::DInt(v)) => BigEndian::write_i32(b, *v),
            (DataType::Real, Value::Real(v)) => BigEndian::write_f32(b, *v),
            (DataType::String, Value::String(v)) => {
                let capacity = address.element_length - 2;
                if v.len() > capacity {
                    return Err(Error::InvalidArgument {
                        reason: format!(
                            "string of {} chars exceeds capacity {} of item `{}`",
                            v.len(),
                            capacity,
                            self.name
                        ),
                    });
                }
                b[0] = capacity as u8;
                b[1] = v.len() as u8;
                for (i, c) in v.chars().enumerate() {
                    b[2 + i] = c as u8;
                }
            }
            (DataType::Timer, Value::Timer(v)) => BigEndian::write_u16(b, encode_s5time(*v)?),
            (DataType::Counter, Value::Counter(v)) => BigEndian::write_u16(b, encode_bcd16(*v)?),
            (DataType::DateTime, Value::DateTime(v)) => encode_date_and_time(b, v),
            (DataType::Time, Value::Time(v)) => BigEndian::write_i32(b, *v),
            _ => return Err(type_mismatch()),
        }
        Ok(())
    }
}

pub(crate) fn from_bcd(b: u8) -> Result<u8, Error> {
    if b >> 4 > 9 || b & 0x0F > 9 {
        return Err(Error::UnexpectedResponse {
            reason: format!("invalid BCD byte 0x{:02X}", b),
        });
    }
    Ok((b >> 4) * 10 + (b & 0x0F))
}

pub(crate) fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Three-digit BCD in the low 12 bits, as counters store their count.
fn decode_bcd16(raw: u16) -> Result<u16, Error> {
    let hundreds = ((raw >> 8) & 0x0F) as u16;
    let tens = ((raw >> 4) & 0x0F) as u16;
    let units = (raw & 0x0F) as u16;
    if hundreds > 9 || tens > 9 || units > 9 {
        return Err(Error::UnexpectedResponse {
            reason: format!("invalid BCD counter 0x{:04X}", raw),
        });
    }
    Ok(hundreds * 100 + tens * 10 + units)
}

fn encode_bcd16(value: u16) -> Result<u16, Error> {
    if value > 999 {
        return Err(Error::InvalidArgument {
            reason: format!("counter value {} outside 0..999", value),
        });
    }
    Ok(((value / 100) << 8) | ((value / 10 % 10) << 4) | (value % 10))
}

/// S5TIME: a three-digit BCD value scaled by the time base in bits 12/13.
fn decode_s5time(raw: u16) -> Result<f32, Error> {
    let base = match (raw >> 12) & 0x03 {
        0 => 0.01,
        1 => 0.1,
        2 => 1.0,
        _ => 10.0,
    };
    Ok(decode_bcd16(raw & 0x0FFF)? as f32 * base)
}

fn encode_s5time(seconds: f32) -> Result<u16, Error> {
    if !(0.0..=9990.0).contains(&seconds) {
        return Err(Error::InvalidArgument {
            reason: format!("timer value {}s outside 0..9990", seconds),
        });
    }
    for (code, base) in [(0u16, 0.01f32), (1, 0.1), (2, 1.0), (3, 10.0)] {
        let ticks = (seconds / base).round();
        if ticks <= 999.0 {
            return Ok((code << 12) | encode_bcd16(ticks as u16)?);
        }
    }
    unreachable!("range checked above")
}

/// DATE_AND_TIME: 8 bytes of BCD; the year is relative to 1990/2000 and
/// the last byte mixes the milliseconds' units digit with the weekday.
fn decode_date_and_time(b: &[u8]) -> Result<NaiveDateTime, Error> {
    let year = from_bcd(b[0])? as i32;
    let year = if year >= 90 { 1900 + year } else { 2000 + year };
    let month = from_bcd(b[1])? as u32;
    let day = from_bcd(b[2])? as u32;
    let hour = from_bcd(b[3])? as u32;
    let minute = from_bcd(b[4])? as u32;
    let second = from_bcd(b[5])? as u32;
    let msec = from_bcd(b[6])? as u32 * 10 + u32::from(b[7] >> 4);
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_milli_opt(hour, minute, second, msec))
        .ok_or_else(|| Error::UnexpectedResponse {
            reason: "DATE_AND_TIME fields out of range".to_string(),
        })
}

fn encode_date_and_time(b: &mut [u8], value: &NaiveDateTime) {
    let year = value.year() % 100;
    b[0] = to_bcd(year as u8);
    b[1] = to_bcd(value.month() as u8);
    b[2] = to_bcd(value.day() as u8);
    b[3] = to_bcd(value.hour() as u8);
    b[4] = to_bcd(value.minute() as u8);
    b[5] = to_bcd(value.second() as u8);
    let msec = value.and_utc().timestamp_subsec_millis();
    b[6] = to_bcd((msec / 10) as u8);
    b[7] = (((msec % 10) as u8) << 4) | (value.weekday().number_from_sunday() as u8);
}

#[cfg(test)]
fn item(addr: &str) -> Item {
    Item::new("it".to_string(), Address::parse(addr).unwrap())
}

#[test]
fn test_scalar_decoding() {
    let mut it = item("DB1,REAL0");
    it.buffer.copy_from_slice(&[0x42, 0x56, 0x00, 0x00]);
    assert_eq!(it.update_value().unwrap(), Value::Real(53.5));

    let mut it = item("DB1,INT0");
    it.buffer.copy_from_slice(&[0xFF, 0xFE]);
    assert_eq!(it.update_value().unwrap(), Value::Int(-2));

    let mut it = item("M10.3");
    it.buffer[0] = 0b0000_1000;
    assert_eq!(it.update_value().unwrap(), Value::Bool(true));

    let mut it = item("DB1,STRING0.8");
    it.buffer.copy_from_slice(&[8, 2, b'h', b'i', 0, 0, 0, 0, 0, 0]);
    assert_eq!(it.update_value().unwrap(), Value::String("hi".to_string()));
}

#[test]
fn test_array_round_trip() {
    let it = item("DB1,WORD0.3");
    let value = Value::Array(vec![Value::Word(1), Value::Word(513), Value::Word(65535)]);
    let buf = it.write_buffer(&value).unwrap();
    assert_eq!(buf, vec![0, 1, 2, 1, 255, 255]);

    let mut it = item("DB1,WORD0.3");
    it.buffer.copy_from_slice(&buf);
    assert_eq!(it.update_value().unwrap(), value);
}

#[test]
fn test_bit_array_decoding() {
    let mut it = item("DB1,X0.6.4");
    assert_eq!(it.byte_length(), 2);
    it.buffer.copy_from_slice(&[0b0100_0000, 0b0000_0010]);
    assert_eq!(
        it.update_value().unwrap(),
        Value::Array(vec![
            Value::Bool(true),
            Value::Bool(false),
            Value::Bool(false),
            Value::Bool(true),
        ])
    );
}

#[test]
fn test_timer_and_counter_codecs() {
    assert_eq!(decode_s5time(0x2127).unwrap(), 127.0);
    assert_eq!(decode_s5time(0x0050).unwrap(), 0.5);
    assert_eq!(encode_s5time(127.0).unwrap(), 0x2127);
    assert_eq!(decode_bcd16(0x0042).unwrap(), 42);
    assert_eq!(encode_bcd16(999).unwrap(), 0x0999);
    assert!(encode_bcd16(1000).is_err());
    assert!(decode_bcd16(0x0A00).is_err());
}

#[test]
fn test_date_and_time_codec() {
    let dt = NaiveDate::from_ymd_opt(2024, 3, 5)
        .unwrap()
        .and_hms_milli_opt(13, 45, 59, 250)
        .unwrap();
    let mut b = [0u8; 8];
    encode_date_and_time(&mut b, &dt);
    assert_eq!(&b[..7], &[0x24, 0x03, 0x05, 0x13, 0x45, 0x59, 0x25]);
    assert_eq!(decode_date_and_time(&b).unwrap(), dt);

    // 1990s era years map below the century split
    let b = [0x95, 0x12, 0x31, 0x23, 0x59, 0x59, 0x00, 0x02];
    assert_eq!(decode_date_and_time(&b).unwrap().year(), 1995);
}

#[test]
fn test_copy_offsets() {
    let it = item("DB1,BYTE10.4");
    // window fully covering the item
    assert_eq!(
        it.copy_offsets(8, 10),
        Some(CopyDescriptor { source: 2, dest: 0, count: 4 })
    );
    // window covering the tail only
    assert_eq!(
        it.copy_offsets(12, 10),
        Some(CopyDescriptor { source: 0, dest: 2, count: 2 })
    );
    // window before the item
    assert_eq!(it.copy_offsets(0, 10), None);
}

#[test]
fn test_write_buffer_validation() {
    let it = item("DB1,INT0");
    assert!(it.write_buffer(&Value::Real(1.0)).is_err());
    let it = item("DB1,INT0.2");
    assert!(it.write_buffer(&Value::Int(1)).is_err());
    let it = item("DB1,BYTE0.3");
    let buf = it
        .write_buffer(&Value::Array(vec![Value::Byte(1), Value::Byte(2), Value::Byte(3)]))
        .unwrap();
    // filled to the word boundary
    assert_eq!(buf, vec![1, 2, 3, 0]);
}
