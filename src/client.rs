// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

use crate::codec::RequestItem;
use crate::connection::{BlockListEntry, ConnectionOptions, S7Connection};
use crate::constant::{
    data_size_byte, Area, BlockLang, BlockType, CpuState, SubBlockType, RC_DATA_OK,
    READ_OVERHEAD, SZL_ID_AVAILABLE, SZL_ID_COMPONENT_IDENT, SZL_ID_CPU_STATE,
    SZL_ID_MODULE_IDENT, WL_BYTE, WL_COUNTER, WL_TIMER, WRITE_OVERHEAD,
};
use crate::error::Error;
use crate::tcp;
use crate::transport::TransportFactory;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// a set of options for the endpoint
#[derive(Clone)]
pub struct Options {
    pub host: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
    /// Our TSAP; `0x0100` unless overridden.
    pub src_tsap: u16,
    /// Peer TSAP, derived from rack and slot when unset.
    pub dst_tsap: Option<u16>,
    /// Delay between reconnection attempts; zero disables reconnection.
    pub auto_reconnect: Duration,
    /// Concurrency window proposed during setup.
    pub max_jobs: u16,
    /// PDU size proposed during setup; the negotiated size never
    /// exceeds the protocol ceiling of 960 bytes.
    pub max_pdu_size: u16,
    /// Per-job deadline.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Disables read coalescing in item groups.
    pub skip_optimization: bool,
    /// Coalesce window in bytes for item groups.
    pub optimization_gap: usize,
    /// Replaces the default ISO-on-TCP transport.
    pub custom_transport: Option<TransportFactory>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            host: "localhost".to_string(),
            port: tcp::ISO_TCP_PORT,
            rack: 0,
            slot: 2,
            src_tsap: 0x0100,
            dst_tsap: None,
            auto_reconnect: Duration::from_millis(5000),
            max_jobs: 8,
            max_pdu_size: 480,
            timeout: Duration::from_millis(2000),
            connect_timeout: tcp::CONNECT_TIMEOUT,
            skip_optimization: false,
            optimization_gap: 5,
            custom_transport: None,
        }
    }
}

impl Options {
    pub fn new(host: &str) -> Options {
        Options {
            host: host.to_string(),
            ..Options::default()
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Options")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("rack", &self.rack)
            .field("slot", &self.slot)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("max_jobs", &self.max_jobs)
            .field("max_pdu_size", &self.max_pdu_size)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Lifecycle and negotiation events, delivered in order within one
/// session.
#[derive(Debug, Clone)]
pub enum Event {
    Connecting,
    Connect,
    Disconnect,
    /// Newly negotiated PDU size, emitted on every (re)connect.
    PduSize(u16),
    /// A failure that already triggered reconnection scheduling.
    Error(Arc<Error>),
}

/// One system status list answer: the envelope fields plus the raw
/// per-entry slices.
#[derive(Debug, Clone)]
pub struct Ssl {
    pub id: u16,
    pub index: u16,
    pub entry_length: u16,
    pub entries: Vec<Bytes>,
}

/// One record of SSL 0x0011. Version words are kept raw; their encoding
/// varies between firmwares.
#[derive(Debug, Clone)]
pub struct ModuleIdent {
    pub index: u16,
    pub order_number: String,
    pub module_type: u16,
    pub hardware_version: u16,
    pub firmware_version: u16,
    pub raw: Bytes,
}

/// Component identification from SSL 0x001C.
#[derive(Debug, Clone, Default)]
pub struct CpuInfo {
    pub as_name: String,
    pub module_name: String,
    pub plant_id: String,
    pub copyright: String,
    pub serial_number: String,
    pub module_type_name: String,
    pub raw_entries: Vec<Bytes>,
}

#[derive(Debug)]
pub struct BlockInfo {
    pub block_type: SubBlockType, //Block Type (see SubBlockType)
    pub block_number: u16,        //Block number
    pub block_lang: BlockLang,    //Block Language (see BlockLang)
    pub block_flags: u8,          //Block flags (bitmapped)
    pub mc7_size: u16,            //The real size in bytes
    pub load_size: i32,           //Load memory size
    pub local_data: u16,          //Local data
    pub sbb_length: u16,          //SBB Length
    pub version: u8,              // Version (BCD 00<HI><LO>)
    pub code_date: NaiveDateTime,
    pub interface_date: NaiveDateTime,
    pub author: String,
    pub family: String,
    pub header: String,
}

struct State {
    connection: Option<S7Connection>,
    generation: u64,
    closing: bool,
    reconnecting: bool,
}

struct Inner {
    options: Options,
    factory: TransportFactory,
    state: Mutex<State>,
    next_generation: AtomicU64,
    events: broadcast::Sender<Event>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// An endpoint talking to one controller. Cheap to clone; all clones
/// share the connection, its event stream and the reconnect machinery.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(options: Options) -> Client {
        let factory = match &options.custom_transport {
            Some(factory) => Arc::clone(factory),
            None => {
                let mut tcp_options =
                    tcp::Options::new(&options.host, options.port, options.rack, options.slot);
                tcp_options.src_tsap = options.src_tsap;
                tcp_options.dst_tsap = options.dst_tsap;
                tcp_options.connect_timeout = options.connect_timeout;
                tcp::factory(tcp_options)
            }
        };
        let (events, _) = broadcast::channel(64);
        Client {
            inner: Arc::new(Inner {
                options,
                factory,
                state: Mutex::new(State {
                    connection: None,
                    generation: 0,
                    closing: false,
                    reconnecting: false,
                }),
                next_generation: AtomicU64::new(1),
                events,
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    /// Subscribes to lifecycle events. Slow consumers lose the oldest
    /// events first.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Negotiated PDU size; 0 while disconnected or negotiating.
    pub fn pdu_size(&self) -> u16 {
        match self.state().connection.as_ref() {
            Some(connection) => connection.pdu_size(),
            None => 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().connection.is_some()
    }

    pub(crate) fn connection(&self) -> Result<S7Connection, Error> {
        self.state().connection.clone().ok_or(Error::NotConnected)
    }

    pub(crate) fn optimization_options(&self) -> (bool, usize) {
        (
            self.inner.options.skip_optimization,
            self.inner.options.optimization_gap,
        )
    }

    /// Opens the transport and negotiates communication. Idempotent; a
    /// second call while connected returns immediately. On failure with
    /// reconnection enabled, retrying continues in the background.
    pub async fn connect(&self) -> Result<(), Error> {
        self.state().closing = false;
        let _guard = self.inner.connect_lock.lock().await;
        if self.state().connection.is_some() {
            return Ok(());
        }
        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.inner.options.auto_reconnect.is_zero() {
                    self.spawn_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Closes the connection, failing every in-flight job, and disables
    /// reconnection until the next [`connect`](Client::connect).
    pub async fn disconnect(&self) {
        let connection = {
            let mut state = self.state();
            state.closing = true;
            state.connection.take()
        };
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
    }

    async fn try_connect(&self) -> Result<(), Error> {
        self.emit(Event::Connecting);
        debug!(options = ?self.inner.options, "connecting");
        let transport = (self.inner.factory)().await?;
        let connection = S7Connection::open(
            transport,
            ConnectionOptions {
                max_jobs: self.inner.options.max_jobs,
                max_pdu_size: self.inner.options.max_pdu_size,
                timeout: self.inner.options.timeout,
            },
        )
        .await?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let was_closing = {
            let mut state = self.state();
            if state.closing {
                true
            } else {
                state.connection = Some(connection.clone());
                state.generation = generation;
                false
            }
        };
        if was_closing {
            connection.disconnect().await;
            return Err(Error::Interrupted);
        }
        debug!(
            pdu_size = connection.pdu_size(),
            window = connection.max_jobs(),
            "connected"
        );
        self.emit(Event::Connect);
        self.emit(Event::PduSize(connection.pdu_size()));
        self.spawn_monitor(connection, generation);
        Ok(())
    }

    fn spawn_monitor(&self, connection: S7Connection, generation: u64) {
        let client = self.clone();
        tokio::spawn(async move {
            connection.closed().await;
            {
                let mut state = client.state();
                if state.generation != generation {
                    return;
                }
                state.connection = None;
            }
            debug!("connection closed");
            client.emit(Event::Disconnect);
            let closing = client.state().closing;
            if !closing && !client.inner.options.auto_reconnect.is_zero() {
                client.spawn_reconnect();
            }
        });
    }

    fn spawn_reconnect(&self) {
        {
            let mut state = self.state();
            if state.reconnecting || state.closing {
                return;
            }
            state.reconnecting = true;
        }
        let client = self.clone();
        let delay = self.inner.options.auto_reconnect;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if client.state().closing {
                    break;
                }
                let _guard = client.inner.connect_lock.lock().await;
                if client.state().connection.is_some() {
                    break;
                }
                match client.try_connect().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "reconnect attempt failed");
                        client.emit(Event::Error(Arc::new(e)));
                    }
                }
            }
            client.state().reconnecting = false;
        });
    }

    /// Reads `length` units from an area: bytes, or elements for timers
    /// and counters. The request is sliced to the PDU limit and the
    /// slices concatenated.
    pub async fn read_area(
        &self,
        area: Area,
        start: u32,
        length: usize,
        db_number: u16,
    ) -> Result<Vec<u8>, Error> {
        let connection = self.connection()?;
        let pdu_size = connection.pdu_size() as usize;
        if pdu_size == 0 {
            return Err(Error::IllegalState {
                reason: "pdu size not negotiated yet",
            });
        }
        let (transport, word_size) = area_transport(area);
        let max_elements = (pdu_size - READ_OVERHEAD) / word_size;

        let mut out = Vec::with_capacity(length * word_size);
        let mut cursor = start;
        let mut remaining = length;
        while remaining > 0 {
            let count = remaining.min(max_elements);
            let item = RequestItem {
                transport,
                length: count as u16,
                db_number,
                area,
                byte_offset: cursor,
                bit_offset: 0,
            };
            let context = item.describe();
            let results = connection.request_read_vars(vec![item]).await?;
            let result = results.into_iter().next().ok_or_else(|| {
                Error::UnexpectedResponse {
                    reason: "read answer without items".to_string(),
                }
            })?;
            if result.code != RC_DATA_OK {
                return Err(Error::ReturnCode {
                    code: result.code,
                    context,
                });
            }
            out.extend_from_slice(&result.data);
            cursor += count as u32;
            remaining -= count;
        }
        Ok(out)
    }

    /// Writes a buffer to an area, sliced to the PDU limit. `buffer`
    /// holds bytes, or 2-byte elements for timers and counters.
    pub async fn write_area(
        &self,
        area: Area,
        start: u32,
        buffer: &[u8],
        db_number: u16,
    ) -> Result<(), Error> {
        let connection = self.connection()?;
        let pdu_size = connection.pdu_size() as usize;
        if pdu_size == 0 {
            return Err(Error::IllegalState {
                reason: "pdu size not negotiated yet",
            });
        }
        let (transport, word_size) = area_transport(area);
        let max_elements = (pdu_size - WRITE_OVERHEAD) / word_size;
        if buffer.len() % word_size != 0 {
            return Err(Error::InvalidArgument {
                reason: format!("buffer of {} bytes is not element aligned", buffer.len()),
            });
        }

        let mut cursor = start;
        let mut offset = 0;
        while offset < buffer.len() {
            let count = ((buffer.len() - offset) / word_size).min(max_elements);
            let chunk = &buffer[offset..offset + count * word_size];
            let item = RequestItem {
                transport,
                length: count as u16,
                db_number,
                area,
                byte_offset: cursor,
                bit_offset: 0,
            };
            let context = item.describe();
            let codes = connection
                .request_write_vars(vec![item], vec![Bytes::copy_from_slice(chunk)])
                .await?;
            match codes.first() {
                Some(&code) if code == RC_DATA_OK => {}
                Some(&code) => return Err(Error::ReturnCode { code, context }),
                None => {
                    return Err(Error::UnexpectedResponse {
                        reason: "write answer without items".to_string(),
                    })
                }
            }
            cursor += count as u32;
            offset += count * word_size;
        }
        Ok(())
    }

    /// Reads from a data block, see [`read_area`](Client::read_area).
    pub async fn db_read(&self, db_number: u16, start: u32, size: usize) -> Result<Vec<u8>, Error> {
        self.read_area(Area::DataBausteine, start, size, db_number).await
    }

    /// Writes into a data block, see [`write_area`](Client::write_area).
    pub async fn db_write(&self, db_number: u16, start: u32, buffer: &[u8]) -> Result<(), Error> {
        self.write_area(Area::DataBausteine, start, buffer, db_number).await
    }

    pub async fn mb_read(&self, start: u32, size: usize) -> Result<Vec<u8>, Error> {
        self.read_area(Area::Merker, start, size, 0).await
    }

    pub async fn mb_write(&self, start: u32, buffer: &[u8]) -> Result<(), Error> {
        self.write_area(Area::Merker, start, buffer, 0).await
    }

    /// Reads a complete data block, sized from its block info.
    pub async fn read_full_db(&self, db_number: u16) -> Result<Vec<u8>, Error> {
        let info = self.block_info(BlockType::Db, db_number as u32).await?;
        self.db_read(db_number, 0, info.mc7_size as usize).await
    }

    // ---- diagnostics -------------------------------------------------

    /// Reads one system status list and splits it into entries.
    pub async fn get_ssl(&self, id: u16, index: u16) -> Result<Ssl, Error> {
        let connection = self.connection()?;
        let mut payload = vec![0u8; 4];
        BigEndian::write_u16(&mut payload[0..], id);
        BigEndian::write_u16(&mut payload[2..], index);
        let data = connection
            .send_user_data(
                crate::constant::FunctionGroup::Cpu,
                crate::constant::SUB_CPU_READ_SZL,
                Bytes::from(payload),
            )
            .await?;
        if data.len() < 8 {
            return Err(Error::UnexpectedResponse {
                reason: format!("SSL envelope of {} bytes", data.len()),
            });
        }
        let entry_length = BigEndian::read_u16(&data[4..]);
        let count = BigEndian::read_u16(&data[6..]) as usize;
        let mut entries = Vec::with_capacity(count);
        let mut offset = 8;
        for _ in 0..count {
            if entry_length == 0 || offset + entry_length as usize > data.len() {
                break;
            }
            entries.push(data.slice(offset..offset + entry_length as usize));
            offset += entry_length as usize;
        }
        Ok(Ssl {
            id: BigEndian::read_u16(&data[0..]),
            index: BigEndian::read_u16(&data[2..]),
            entry_length,
            entries,
        })
    }

    /// Ids of every system status list the controller offers.
    pub async fn get_available_ssl(&self) -> Result<Vec<u16>, Error> {
        let ssl = self.get_ssl(SZL_ID_AVAILABLE, 0x0000).await?;
        Ok(ssl
            .entries
            .iter()
            .filter(|entry| entry.len() >= 2)
            .map(|entry| BigEndian::read_u16(entry))
            .collect())
    }

    /// Module identification from SSL 0x0011.
    pub async fn get_module_identification(&self) -> Result<Vec<ModuleIdent>, Error> {
        let ssl = self.get_ssl(SZL_ID_MODULE_IDENT, 0x0000).await?;
        let mut modules = Vec::with_capacity(ssl.entries.len());
        for entry in &ssl.entries {
            if entry.len() < 28 {
                continue;
            }
            modules.push(ModuleIdent {
                index: BigEndian::read_u16(&entry[0..]),
                order_number: to_chars(&entry[2..22]),
                module_type: BigEndian::read_u16(&entry[22..]),
                hardware_version: BigEndian::read_u16(&entry[24..]),
                firmware_version: BigEndian::read_u16(&entry[26..]),
                raw: entry.clone(),
            });
        }
        Ok(modules)
    }

    /// Component identification from SSL 0x001C.
    pub async fn get_component_identification(&self) -> Result<CpuInfo, Error> {
        let ssl = self.get_ssl(SZL_ID_COMPONENT_IDENT, 0x0000).await?;
        let mut info = CpuInfo::default();
        for entry in &ssl.entries {
            if entry.len() < 3 {
                continue;
            }
            let text = to_chars(&entry[2..]);
            match BigEndian::read_u16(&entry[0..]) {
                1 => info.as_name = text,
                2 => info.module_name = text,
                3 => info.plant_id = text,
                4 => info.copyright = text,
                5 => info.serial_number = text,
                7 => info.module_type_name = text,
                _ => {}
            }
        }
        info.raw_entries = ssl.entries;
        Ok(info)
    }

    /// Operating state of the CPU, from SSL 0x0424.
    pub async fn cpu_state(&self) -> Result<CpuState, Error> {
        let ssl = self.get_ssl(SZL_ID_CPU_STATE, 0x0000).await?;
        let entry = ssl.entries.first().ok_or_else(|| Error::UnexpectedResponse {
            reason: "empty CPU state list".to_string(),
        })?;
        if entry.len() < 4 {
            return Err(Error::UnexpectedResponse {
                reason: "short CPU state entry".to_string(),
            });
        }
        Ok(CpuState::from_u8(entry[3] & 0x0F).unwrap_or(CpuState::Unknown))
    }

    // ---- block services ----------------------------------------------

    /// Block counts per type.
    pub async fn block_count(&self) -> Result<HashMap<BlockType, u16>, Error> {
        self.connection()?.block_count().await
    }

    /// Numbers, flags and languages of every block of one type.
    pub async fn list_blocks(&self, block_type: BlockType) -> Result<Vec<BlockListEntry>, Error> {
        self.connection()?.list_blocks(block_type).await
    }

    /// Raw block-info envelope from the active filesystem.
    pub async fn get_block_info(
        &self,
        block_type: BlockType,
        number: u32,
    ) -> Result<Bytes, Error> {
        self.connection()?.get_block_info(block_type, number, 'A').await
    }

    /// Parsed block info.
    pub async fn block_info(&self, block_type: BlockType, number: u32) -> Result<BlockInfo, Error> {
        let data = self.get_block_info(block_type, number).await?;
        parse_block_info(&data)
    }

    /// Uploads a program block by its filename, e.g. `_0A00001A`.
    pub async fn upload_block(&self, filename: &str) -> Result<Vec<u8>, Error> {
        self.connection()?.upload_block(filename).await
    }

    /// Builds the upload filename for a block and uploads it.
    pub async fn upload(&self, block_type: BlockType, number: u32) -> Result<Vec<u8>, Error> {
        if number > 99999 {
            return Err(Error::InvalidArgument {
                reason: format!("block number {} has more than five digits", number),
            });
        }
        let filename = format!("_0{}{:05}A", (block_type as u8) as char, number);
        self.upload_block(&filename).await
    }

    // ---- clock -------------------------------------------------------

    pub async fn get_time(&self) -> Result<NaiveDateTime, Error> {
        self.connection()?.get_time().await
    }

    pub async fn set_time(&self, time: NaiveDateTime) -> Result<(), Error> {
        self.connection()?.set_time(time).await
    }
}

fn area_transport(area: Area) -> (u8, usize) {
    let transport = match area {
        Area::Timer => WL_TIMER,
        Area::Counter => WL_COUNTER,
        _ => WL_BYTE,
    };
    (transport, data_size_byte(transport))
}

/// ASCII field to trimmed string, dropping NULs and trailing blanks.
fn to_chars(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// days-since-1984 words of the block header
fn siemens_timestamp(days: u16) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1984, 1, 1)?
        .checked_add_days(chrono::Days::new(days as u64))?
        .and_hms_opt(0, 0, 0)
}

fn parse_block_info(data: &[u8]) -> Result<BlockInfo, Error> {
    if data.len() < 65 {
        return Err(Error::UnexpectedResponse {
            reason: format!("block info of {} bytes", data.len()),
        });
    }
    let bad_date = || Error::UnexpectedResponse {
        reason: "block timestamp out of range".to_string(),
    };
    Ok(BlockInfo {
        block_flags: data[7],
        block_lang: BlockLang::from_u8(data[8])?,
        block_type: SubBlockType::from_u8(data[9])?,
        block_number: BigEndian::read_u16(&data[10..]),
        load_size: BigEndian::read_i32(&data[12..]),
        code_date: siemens_timestamp(BigEndian::read_u16(&data[24..])).ok_or_else(bad_date)?,
        interface_date: siemens_timestamp(BigEndian::read_u16(&data[30..])).ok_or_else(bad_date)?,
        sbb_length: BigEndian::read_u16(&data[32..]),
        local_data: BigEndian::read_u16(&data[36..]),
        mc7_size: BigEndian::read_u16(&data[38..]),
        author: to_chars(&data[40..48]),
        family: to_chars(&data[48..56]),
        header: to_chars(&data[56..64]),
        version: data[64],
    })
}

#[test]
fn test_to_chars_trims() {
    assert_eq!(to_chars(b"6ES7 215\0\0\0"), "6ES7 215");
    assert_eq!(to_chars(b"NAME    "), "NAME");
}

#[test]
fn test_siemens_timestamp() {
    let date = siemens_timestamp(366).unwrap();
    assert_eq!(date.date(), NaiveDate::from_ymd_opt(1985, 1, 1).unwrap());
}

#[test]
fn test_parse_block_info() {
    let mut data = vec![0u8; 78];
    data[7] = 0x01; // flags
    data[8] = 0x05; // DB language
    data[9] = 0x0A; // DB
    BigEndian::write_u16(&mut data[10..], 888);
    BigEndian::write_i32(&mut data[12..], 1024);
    BigEndian::write_u16(&mut data[24..], 366);
    BigEndian::write_u16(&mut data[30..], 400);
    BigEndian::write_u16(&mut data[32..], 12);
    BigEndian::write_u16(&mut data[36..], 0);
    BigEndian::write_u16(&mut data[38..], 256);
    data[40..44].copy_from_slice(b"auth");
    data[64] = 0x21;
    let info = parse_block_info(&data).unwrap();
    assert_eq!(info.block_number, 888);
    assert_eq!(info.mc7_size, 256);
    assert_eq!(info.load_size, 1024);
    assert_eq!(info.author, "auth");
    assert_eq!(info.version, 0x21);
    assert_eq!(info.code_date.date(), NaiveDate::from_ymd_opt(1985, 1, 1).unwrap());
}
