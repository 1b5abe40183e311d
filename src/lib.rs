// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! This crate provides asynchronous communication tools for Siemens s7 family devices
//!
//! The endpoint multiplexes any number of concurrent reads and writes
//! over one negotiated connection; item groups pack tag reads into as
//! few telegrams as the PDU size allows.
//!
//! # Examples
//! ```no_run
//! use s7comm::{Client, ItemGroup, Options};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), s7comm::Error> {
//!     let mut options = Options::new("192.168.0.1");
//!     options.rack = 0;
//!     options.slot = 2;
//!
//!     let client = Client::new(options);
//!     client.connect().await?;
//!
//!     let mut group = ItemGroup::new(&client);
//!     group.add_items(&["DB1,REAL0", "DB1,INT4", "M10.3"])?;
//!
//!     let values = group.read_all().await?;
//!     println!("{:?}", values["DB1,REAL0"]);
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod client;
mod codec;
mod connection;
pub mod constant;
pub mod error;
pub mod group;
pub mod item;
pub mod tcp;
pub mod transport;

pub use address::{Address, DataType};
pub use client::{BlockInfo, Client, CpuInfo, Event, ModuleIdent, Options, Ssl};
pub use connection::BlockListEntry;
pub use constant::{Area, BlockLang, BlockType, CpuState, SubBlockType};
pub use error::Error;
pub use group::ItemGroup;
pub use item::{Item, Value};
