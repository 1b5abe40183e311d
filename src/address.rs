// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Parses textual tag addresses (`DB5,REAL12.4`, `M10.3`, `DB1.DBW2`, ...)
//! into typed address records

use crate::constant::{self, Area};
use crate::error::Error;
use std::str::FromStr;

/// Data type of one PLC variable element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Byte,
    Char,
    Word,
    Int,
    DWord,
    DInt,
    Real,
    String,
    Timer,
    Counter,
    DateTime,
    Time,
}

impl DataType {
    /// Bytes of one element. Strings size themselves from the declared
    /// capacity, see [`Address::element_length`].
    pub fn size(self) -> usize {
        match self {
            DataType::Bool | DataType::Byte | DataType::Char => 1,
            DataType::Word | DataType::Int | DataType::Timer | DataType::Counter => 2,
            DataType::DWord | DataType::DInt | DataType::Real | DataType::Time => 4,
            DataType::DateTime => 8,
            DataType::String => 0,
        }
    }
}

/// A fully resolved tag address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub area: Area,
    /// Data block number, 0 unless the area carries one.
    pub db_number: u16,
    pub data_type: DataType,
    pub byte_offset: u32,
    /// Bit position inside the byte, nonzero only for `Bool`.
    pub bit_offset: u8,
    /// Number of array elements, at least 1.
    pub length: u16,
    /// Bytes of one element; `capacity + 2` for strings.
    pub element_length: usize,
}

impl Address {
    /// Bytes the PLC returns for a read of this address. Bit arrays are
    /// promoted to the byte window covering all addressed bits.
    pub fn byte_length(&self) -> usize {
        match self.data_type {
            DataType::Bool => (self.bit_offset as usize + self.length as usize + 7) / 8,
            _ => self.length as usize * self.element_length,
        }
    }

    /// Bytes sent when writing this address. Bits are written one byte
    /// per element through the bit transport.
    pub fn write_byte_length(&self) -> usize {
        match self.data_type {
            DataType::Bool => self.length as usize,
            _ => self.length as usize * self.element_length,
        }
    }

    /// Write length rounded up to the word boundary the controllers
    /// expect for byte-addressed transports.
    pub fn byte_length_with_fill(&self) -> usize {
        let len = self.write_byte_length();
        match self.data_type {
            DataType::Bool => len,
            _ => (len + 1) / 2 * 2,
        }
    }

    /// Word-length code used when this address appears in a ReadVar item.
    pub fn read_transport(&self) -> u8 {
        match self.data_type {
            DataType::Timer => constant::WL_TIMER,
            DataType::Counter => constant::WL_COUNTER,
            _ => constant::WL_BYTE,
        }
    }

    /// Word-length code used when this address appears in a WriteVar item.
    pub fn write_transport(&self) -> u8 {
        match self.data_type {
            DataType::Bool => constant::WL_BIT,
            DataType::Timer => constant::WL_TIMER,
            DataType::Counter => constant::WL_COUNTER,
            _ => constant::WL_BYTE,
        }
    }

    /// Parses the Siemens textual form, case-insensitively. Both the
    /// comma syntax (`DB1,INT2`) and the Step7 dotted syntax
    /// (`DB1.DBW2`) are accepted; instance data blocks use the `DI`
    /// prefix (`DI5,INT2`, `DI1.DIW2`).
    pub fn parse(address: &str) -> Result<Address, Error> {
        let s = address.trim().to_ascii_uppercase();
        let fail = |reason: &str| Error::ParseAddr {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        // data blocks and instance data blocks share the prefixed forms
        let blocks = [
            ("DB", Area::DataBausteine),
            ("DI", Area::InstanceDataBausteine),
        ];
        for (prefix, area) in blocks {
            if s.len() > 2 && s.starts_with(prefix) && s.as_bytes()[2].is_ascii_digit() {
                let rest = &s[2..];
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                let db_number = digits
                    .parse::<u16>()
                    .map_err(|_| fail("data block number out of range"))?;
                let rest = &rest[digits.len()..];

                return match rest.chars().next() {
                    Some(',') => {
                        parse_typed(area, db_number, &rest[1..]).map_err(wrap(address))
                    }
                    Some('.') if rest[1..].starts_with(prefix) => {
                        parse_block_dotted(area, db_number, &rest[3..]).map_err(wrap(address))
                    }
                    _ => Err(fail("expected `,TYPE` or a dotted size letter after the block number")),
                };
            }
        }

        parse_plain(&s).map_err(wrap(address))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Address, Error> {
        Address::parse(s)
    }
}

fn wrap(address: &str) -> impl Fn(String) -> Error + '_ {
    move |reason| Error::ParseAddr {
        address: address.to_string(),
        reason,
    }
}

fn build(
    area: Area,
    db_number: u16,
    data_type: DataType,
    fields: &[u32],
) -> Result<Address, String> {
    let mut addr = Address {
        area,
        db_number,
        data_type,
        byte_offset: *fields.first().ok_or("missing byte offset")?,
        bit_offset: 0,
        length: 1,
        element_length: data_type.size(),
    };

    match data_type {
        DataType::Bool => {
            let bit = *fields.get(1).ok_or("bit address required for a bit type")?;
            if bit > 7 {
                return Err(format!("bit address {} outside 0..7", bit));
            }
            addr.bit_offset = bit as u8;
            if let Some(&len) = fields.get(2) {
                addr.length = check_length(len)?;
            }
            if fields.len() > 3 {
                return Err("too many address fields".to_string());
            }
        }
        DataType::String => {
            let capacity = *fields.get(1).ok_or("string capacity required")?;
            if capacity == 0 || capacity > 254 {
                return Err(format!("string capacity {} outside 1..254", capacity));
            }
            addr.element_length = capacity as usize + 2;
            if let Some(&len) = fields.get(2) {
                addr.length = check_length(len)?;
            }
            if fields.len() > 3 {
                return Err("too many address fields".to_string());
            }
        }
        _ => {
            if let Some(&len) = fields.get(1) {
                addr.length = check_length(len)?;
            }
            if fields.len() > 2 {
                return Err("too many address fields".to_string());
            }
        }
    }
    Ok(addr)
}

fn check_length(len: u32) -> Result<u16, String> {
    if len == 0 {
        return Err("array length must be positive".to_string());
    }
    u16::try_from(len).map_err(|_| format!("array length {} out of range", len))
}

fn number_fields(s: &str) -> Result<Vec<u32>, String> {
    if s.is_empty() {
        return Err("missing byte offset".to_string());
    }
    s.split('.')
        .map(|f| {
            if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("malformed number `{}`", f));
            }
            f.parse::<u32>().map_err(|_| format!("number `{}` out of range", f))
        })
        .collect()
}

/// `DB1,INT2` style: a type token followed by dotted numbers.
fn parse_typed(area: Area, db_number: u16, rest: &str) -> Result<Address, String> {
    let token: String = rest.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let data_type = match token.as_str() {
        "X" | "BOOL" => DataType::Bool,
        "B" | "BYTE" | "USINT" => DataType::Byte,
        "C" | "CHAR" => DataType::Char,
        "W" | "WORD" | "UINT" => DataType::Word,
        "I" | "INT" => DataType::Int,
        "D" | "DW" | "DWORD" | "UDINT" => DataType::DWord,
        "DI" | "DINT" => DataType::DInt,
        "R" | "REAL" => DataType::Real,
        "S" | "STRING" => DataType::String,
        "DT" | "DTZ" => DataType::DateTime,
        "TIME" => DataType::Time,
        _ => return Err(format!("unknown data type `{}`", token)),
    };
    let fields = number_fields(&rest[token.len()..])?;
    build(area, db_number, data_type, &fields)
}

/// `DB1.DBW2` / `DI1.DIW2` style: block prefix already consumed, a
/// single size letter left.
fn parse_block_dotted(area: Area, db_number: u16, rest: &str) -> Result<Address, String> {
    let (data_type, skip) = match rest.chars().next() {
        Some('X') => (DataType::Bool, 1),
        Some('B') => (DataType::Byte, 1),
        Some('W') => (DataType::Word, 1),
        Some('D') => (DataType::DWord, 1),
        _ => return Err("expected a X/B/W/D size letter".to_string()),
    };
    let fields = number_fields(&rest[skip..])?;
    build(area, db_number, data_type, &fields)
}

/// Areas addressed without a DB prefix: `I0.0`, `MW10`, `T5`, ...
fn parse_plain(s: &str) -> Result<Address, String> {
    let token: String = s.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if token.is_empty() {
        return Err("missing area letter".to_string());
    }

    let (area_letter, type_token) = token.split_at(1);
    let area = match area_letter {
        "I" | "E" => Area::ProcessInput,
        "Q" | "A" => Area::ProcessOutput,
        "M" | "F" => Area::Merker,
        "T" => Area::Timer,
        "C" | "Z" => Area::Counter,
        "L" => Area::Local,
        "V" => Area::V,
        _ => return Err(format!("unknown area letter `{}`", area_letter)),
    };
    let fields = number_fields(&s[token.len()..])?;

    if matches!(area, Area::Timer | Area::Counter) {
        if !type_token.is_empty() {
            return Err(format!("timers and counters take no data type, got `{}`", type_token));
        }
        let data_type = if area == Area::Timer { DataType::Timer } else { DataType::Counter };
        // one field: element number; optional second: array length
        let mut addr = build(area, 0, data_type, &fields[..1])?;
        if let Some(&len) = fields.get(1) {
            addr.length = check_length(len)?;
        }
        if fields.len() > 2 {
            return Err("too many address fields".to_string());
        }
        return Ok(addr);
    }

    let data_type = match type_token {
        // `M10.3` addresses a bit, `M10` a byte
        "" => {
            if fields.len() >= 2 {
                DataType::Bool
            } else {
                DataType::Byte
            }
        }
        "X" | "BOOL" => DataType::Bool,
        "B" | "BYTE" => DataType::Byte,
        "C" | "CHAR" => DataType::Char,
        "W" | "WORD" => DataType::Word,
        "I" | "INT" => DataType::Int,
        "D" | "DW" | "DWORD" => DataType::DWord,
        "DI" | "DINT" => DataType::DInt,
        "R" | "REAL" => DataType::Real,
        "DT" => DataType::DateTime,
        "TIME" => DataType::Time,
        _ => return Err(format!("unknown data type `{}`", type_token)),
    };
    build(area, 0, data_type, &fields)
}

#[test]
fn test_db_comma_forms() {
    let a = Address::parse("DB5,REAL12.4").unwrap();
    assert_eq!(a.area, Area::DataBausteine);
    assert_eq!(a.db_number, 5);
    assert_eq!(a.data_type, DataType::Real);
    assert_eq!(a.byte_offset, 12);
    assert_eq!(a.length, 4);
    assert_eq!(a.byte_length(), 16);

    let a = Address::parse("db1,int2").unwrap();
    assert_eq!(a.data_type, DataType::Int);
    assert_eq!(a.byte_offset, 2);
    assert_eq!(a.length, 1);

    let a = Address::parse("DB1,X4.0.8").unwrap();
    assert_eq!(a.data_type, DataType::Bool);
    assert_eq!(a.bit_offset, 0);
    assert_eq!(a.length, 8);
    assert_eq!(a.byte_length(), 1);

    let a = Address::parse("DB1,STRING14.20").unwrap();
    assert_eq!(a.element_length, 22);
    assert_eq!(a.byte_length(), 22);
}

#[test]
fn test_db_dotted_forms() {
    let a = Address::parse("DB1.DBW2").unwrap();
    assert_eq!(a.area, Area::DataBausteine);
    assert_eq!(a.db_number, 1);
    assert_eq!(a.data_type, DataType::Word);
    assert_eq!(a.byte_offset, 2);

    let a = Address::parse("DB3.DBX0.5").unwrap();
    assert_eq!(a.data_type, DataType::Bool);
    assert_eq!(a.bit_offset, 5);
}

#[test]
fn test_instance_db_forms() {
    let a = Address::parse("DI5,INT2").unwrap();
    assert_eq!(a.area, Area::InstanceDataBausteine);
    assert_eq!(a.db_number, 5);
    assert_eq!(a.data_type, DataType::Int);
    assert_eq!(a.byte_offset, 2);

    let a = Address::parse("di1,real4.3").unwrap();
    assert_eq!(a.area, Area::InstanceDataBausteine);
    assert_eq!(a.length, 3);

    let a = Address::parse("DI1.DIX0.5").unwrap();
    assert_eq!(a.area, Area::InstanceDataBausteine);
    assert_eq!(a.data_type, DataType::Bool);
    assert_eq!(a.bit_offset, 5);

    let a = Address::parse("DI3.DIW2").unwrap();
    assert_eq!(a.area, Area::InstanceDataBausteine);
    assert_eq!(a.data_type, DataType::Word);
    assert_eq!(a.byte_offset, 2);

    // mixed block markers and a bare D area stay invalid
    assert!(Address::parse("DI5.DBW2").is_err());
    assert!(Address::parse("D5,INT2").is_err());
}

#[test]
fn test_plain_areas() {
    let a = Address::parse("M10.3").unwrap();
    assert_eq!(a.area, Area::Merker);
    assert_eq!(a.data_type, DataType::Bool);
    assert_eq!(a.byte_offset, 10);
    assert_eq!(a.bit_offset, 3);

    let a = Address::parse("IW0").unwrap();
    assert_eq!(a.area, Area::ProcessInput);
    assert_eq!(a.data_type, DataType::Word);

    let a = Address::parse("QB1.4").unwrap();
    assert_eq!(a.area, Area::ProcessOutput);
    assert_eq!(a.length, 4);

    let a = Address::parse("T5").unwrap();
    assert_eq!(a.area, Area::Timer);
    assert_eq!(a.data_type, DataType::Timer);
    assert_eq!(a.byte_offset, 5);

    let a = Address::parse("C2.3").unwrap();
    assert_eq!(a.area, Area::Counter);
    assert_eq!(a.length, 3);
}

#[test]
fn test_rejects() {
    // bit offset outside 0..7
    assert!(Address::parse("M10.8").is_err());
    assert!(Address::parse("DB1,X0.9").is_err());
    // zero or negative lengths
    assert!(Address::parse("DB1,BYTE0.0.0").is_err());
    assert!(Address::parse("QB1.0").is_err());
    // malformed tokens
    assert!(Address::parse("DB1,FLOAT0").is_err());
    assert!(Address::parse("DB1").is_err());
    assert!(Address::parse("10.3").is_err());
    assert!(Address::parse("DB1,X4").is_err());
    assert!(Address::parse("TW5").is_err());
}

#[test]
fn test_fill_lengths() {
    let a = Address::parse("DB1,BYTE0.3").unwrap();
    assert_eq!(a.byte_length(), 3);
    assert_eq!(a.byte_length_with_fill(), 4);

    let a = Address::parse("DB1,WORD0.3").unwrap();
    assert_eq!(a.byte_length_with_fill(), 6);

    let a = Address::parse("DB1,X0.1").unwrap();
    assert_eq!(a.byte_length_with_fill(), 1);
}
