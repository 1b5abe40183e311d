//! A scripted controller for endpoint tests. It speaks raw S7 frames so
//! the library's serializer is checked against an independent reading of
//! the wire format.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use s7comm::error::Error;
use s7comm::transport::{BoxedTransport, FramedTransport, TransportFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct MockTransport {
    to_plc: mpsc::Sender<Bytes>,
    from_plc: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FramedTransport for MockTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        self.to_plc.send(frame).await.map_err(|_| Error::Iso {
            reason: "mock plc gone".to_string(),
        })
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, Error> {
        Ok(self.from_plc.recv().await)
    }
}

#[derive(Default)]
pub struct Counters {
    pub connections: AtomicUsize,
    pub read_jobs: AtomicUsize,
    pub write_jobs: AtomicUsize,
    pub outstanding: AtomicUsize,
    pub peak_outstanding: AtomicUsize,
    pub continuations: AtomicUsize,
    pub end_uploads: AtomicUsize,
    pub aborted_uploads: AtomicUsize,
}

pub struct PlcState {
    /// Negotiated maximums offered by the controller.
    pub pdu_size: u16,
    pub max_jobs: u16,
    /// Byte images per (area, db).
    pub memory: HashMap<(u8, u16), Vec<u8>>,
    /// Answer reads of this (area, db, start) with return code 0x05.
    pub fail_read_at: Option<(u8, u16, u32)>,
    /// Delay before each job answer.
    pub response_delay: Duration,
    /// Swallow ReadVar jobs entirely.
    pub ignore_reads: bool,
    /// Close the session right after the setup answer, n times.
    pub drop_connections: usize,
    /// Upload image chunks, served in order.
    pub upload_chunks: Vec<Vec<u8>>,
    /// Answer this upload chunk index with a PDU-level error.
    pub upload_fail_at: Option<usize>,
    /// System status lists, payload per id (envelope included).
    pub ssl: HashMap<u16, Vec<u8>>,
    /// Split SSL answers into data units of this size.
    pub ssl_segment_size: Option<usize>,
    /// Controller clock image.
    pub clock: [u8; 10],
    /// Block counts as (ASCII type, count) records.
    pub block_counts: Vec<(u8, u16)>,
    /// Blocks served for the list-of-type service.
    pub blocks_of_type: Vec<(u16, u8, u8)>,
    /// Raw block info payload.
    pub block_info: Vec<u8>,
}

impl Default for PlcState {
    fn default() -> PlcState {
        PlcState {
            pdu_size: 480,
            max_jobs: 8,
            memory: HashMap::new(),
            fail_read_at: None,
            response_delay: Duration::ZERO,
            ignore_reads: false,
            drop_connections: 0,
            upload_chunks: Vec::new(),
            upload_fail_at: None,
            ssl: HashMap::new(),
            ssl_segment_size: None,
            clock: [0, 0x20, 0x24, 0x01, 0x02, 0x03, 0x04, 0x05, 0x00, 0x02],
            block_counts: Vec::new(),
            blocks_of_type: Vec::new(),
            block_info: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct MockPlc {
    pub state: Arc<Mutex<PlcState>>,
    pub counters: Arc<Counters>,
}

impl MockPlc {
    pub fn new() -> MockPlc {
        MockPlc {
            state: Arc::new(Mutex::new(PlcState::default())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut PlcState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn factory(&self) -> TransportFactory {
        let plc = self.clone();
        Arc::new(move || {
            let plc = plc.clone();
            let dial: s7comm::transport::TransportFuture = Box::pin(async move {
                plc.counters.connections.fetch_add(1, Ordering::SeqCst);
                let (to_plc, from_client) = mpsc::channel::<Bytes>(64);
                let (to_client, from_plc) = mpsc::channel::<Bytes>(64);
                tokio::spawn(session(plc, from_client, to_client));
                Ok(Box::new(MockTransport { to_plc, from_plc }) as BoxedTransport)
            });
            dial
        })
    }
}

struct Session {
    plc: MockPlc,
    to_client: mpsc::Sender<Bytes>,
    next_upload_chunk: usize,
    ssl_segments: VecDeque<Vec<u8>>,
    ssl_sequence: u8,
}

async fn session(plc: MockPlc, mut from_client: mpsc::Receiver<Bytes>, to_client: mpsc::Sender<Bytes>) {
    let mut session = Session {
        plc,
        to_client,
        next_upload_chunk: 0,
        ssl_segments: VecDeque::new(),
        ssl_sequence: 0,
    };
    while let Some(frame) = from_client.recv().await {
        if !session.handle(frame.to_vec()).await {
            break;
        }
    }
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn header(rosctr: u8, pdu_ref: u16, param: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x32, rosctr, 0, 0];
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(param.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    if rosctr == 0x03 {
        frame.extend_from_slice(&[0, 0]); // error class + code
    }
    frame.extend_from_slice(param);
    frame.extend_from_slice(data);
    frame
}

fn error_frame(pdu_ref: u16, class: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![0x32, 0x03, 0, 0];
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0, class, code]);
    frame
}

impl Session {
    /// Returns false once the session should close.
    async fn handle(&mut self, frame: Vec<u8>) -> bool {
        assert_eq!(frame[0], 0x32, "client sent a non-S7 frame");
        let rosctr = frame[1];
        let pdu_ref = be16(&frame[4..]);
        let param_len = be16(&frame[6..]) as usize;
        let param = &frame[10..10 + param_len];
        let data = &frame[10 + param_len..];

        let (delay, response, keep_open) = match rosctr {
            0x01 => self.job(pdu_ref, param, data),
            0x07 => self.user_data(pdu_ref, param, data),
            other => panic!("unexpected ROSCTR 0x{:02X}", other),
        };

        if let Some(response) = response {
            let counters = Arc::clone(&self.plc.counters);
            let to_client = self.to_client.clone();
            if delay.is_zero() {
                counters.outstanding.fetch_sub(1, Ordering::SeqCst);
                let _ = to_client.send(Bytes::from(response)).await;
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // decrement before the answer can trigger the next job
                    counters.outstanding.fetch_sub(1, Ordering::SeqCst);
                    let _ = to_client.send(Bytes::from(response)).await;
                });
            }
        }
        keep_open
    }

    fn track_outstanding(&self) {
        let counters = &self.plc.counters;
        let now = counters.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_outstanding.fetch_max(now, Ordering::SeqCst);
    }

    fn job(&mut self, pdu_ref: u16, param: &[u8], data: &[u8]) -> (Duration, Option<Vec<u8>>, bool) {
        self.track_outstanding();
        let mut state = self.plc.state.lock().unwrap();
        let delay = state.response_delay;
        match param[0] {
            0xF0 => {
                let caller = be16(&param[2..]);
                let callee = be16(&param[4..]);
                let wanted = be16(&param[6..]);
                let mut response_param = vec![0xF0, 0x00];
                response_param.extend_from_slice(&caller.min(state.max_jobs).to_be_bytes());
                response_param.extend_from_slice(&callee.min(state.max_jobs).to_be_bytes());
                response_param.extend_from_slice(&wanted.min(state.pdu_size).to_be_bytes());
                let keep_open = if state.drop_connections > 0 {
                    state.drop_connections -= 1;
                    false
                } else {
                    true
                };
                (delay, Some(header(0x03, pdu_ref, &response_param, &[])), keep_open)
            }
            0x04 => {
                self.plc.counters.read_jobs.fetch_add(1, Ordering::SeqCst);
                if state.ignore_reads {
                    return (delay, None, true);
                }
                let count = param[1] as usize;
                let mut out = Vec::new();
                for i in 0..count {
                    let item = &param[2 + i * 12..2 + (i + 1) * 12];
                    let last = i + 1 == count;
                    read_item(&mut state, item, last, &mut out);
                }
                let response_param = [0x04, count as u8];
                (delay, Some(header(0x03, pdu_ref, &response_param, &out)), true)
            }
            0x05 => {
                self.plc.counters.write_jobs.fetch_add(1, Ordering::SeqCst);
                let count = param[1] as usize;
                let mut cursor = 0usize;
                for i in 0..count {
                    let item = &param[2 + i * 12..2 + (i + 1) * 12];
                    cursor = write_item(&mut state, item, data, cursor);
                }
                let response_param = [0x05, count as u8];
                let codes = vec![0xFFu8; count];
                (delay, Some(header(0x03, pdu_ref, &response_param, &codes)), true)
            }
            0x1D => {
                self.next_upload_chunk = 0;
                let mut response_param = vec![0x1D, 0, 0, 0, 0, 0, 0, 7];
                let total: usize = state.upload_chunks.iter().map(Vec::len).sum();
                response_param.push(7);
                response_param.extend_from_slice(format!("{:07}", total).as_bytes());
                (delay, Some(header(0x03, pdu_ref, &response_param, &[])), true)
            }
            0x1E => {
                if state.upload_fail_at == Some(self.next_upload_chunk) {
                    return (delay, Some(error_frame(pdu_ref, 0x81, 0x04)), true);
                }
                let chunk = state.upload_chunks[self.next_upload_chunk].clone();
                self.next_upload_chunk += 1;
                let more = self.next_upload_chunk < state.upload_chunks.len();
                let response_param = [0x1E, if more { 1 } else { 0 }];
                let mut out = Vec::new();
                out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
                out.extend_from_slice(&[0x00, 0xFB]);
                out.extend_from_slice(&chunk);
                (delay, Some(header(0x03, pdu_ref, &response_param, &out)), true)
            }
            0x1F => {
                self.plc.counters.end_uploads.fetch_add(1, Ordering::SeqCst);
                if param[1] == 0x01 {
                    self.plc.counters.aborted_uploads.fetch_add(1, Ordering::SeqCst);
                }
                (delay, Some(header(0x03, pdu_ref, &[0x1F], &[])), true)
            }
            other => panic!("unexpected job function 0x{:02X}", other),
        }
    }

    fn user_data(&mut self, pdu_ref: u16, param: &[u8], data: &[u8]) -> (Duration, Option<Vec<u8>>, bool) {
        self.track_outstanding();
        assert_eq!(&param[0..3], &[0x00, 0x01, 0x12]);
        let plen = param[3] as usize;
        let method = param[4];
        let group = param[5] & 0x0F;
        let subfunction = param[6];
        let sequence = param[7];
        let delay = self.plc.state.lock().unwrap().response_delay;

        if plen == 8 && method == 0x12 {
            // continuation of a segmented answer
            self.plc.counters.continuations.fetch_add(1, Ordering::SeqCst);
            let segment = self.ssl_segments.pop_front().expect("continuation without data");
            let last = self.ssl_segments.is_empty();
            self.ssl_sequence = sequence.wrapping_add(1);
            let response = self.user_data_frame(pdu_ref, group, subfunction, sequence, last, &segment);
            return (delay, Some(response), true);
        }

        let payload = &data[4..]; // behind the data item header
        match (group, subfunction) {
            (0x4, 0x01) => {
                let id = be16(&payload[0..]);
                let ssl = {
                    let state = self.plc.state.lock().unwrap();
                    state.ssl.get(&id).cloned().unwrap_or_default()
                };
                let segment_size = self.plc.state.lock().unwrap().ssl_segment_size;
                self.ssl_segments = match segment_size {
                    Some(size) => ssl.chunks(size).map(<[u8]>::to_vec).collect(),
                    None => VecDeque::from([ssl]),
                };
                let segment = self.ssl_segments.pop_front().unwrap_or_default();
                let last = self.ssl_segments.is_empty();
                let response =
                    self.user_data_frame(pdu_ref, group, subfunction, sequence, last, &segment);
                (delay, Some(response), true)
            }
            (0x7, 0x01) => {
                let clock = self.plc.state.lock().unwrap().clock;
                let response = self.user_data_frame(pdu_ref, group, subfunction, sequence, true, &clock);
                (delay, Some(response), true)
            }
            (0x7, 0x02) => {
                let mut clock = [0u8; 10];
                clock.copy_from_slice(&payload[0..10]);
                self.plc.state.lock().unwrap().clock = clock;
                let response = self.user_data_frame(pdu_ref, group, subfunction, sequence, true, &[]);
                (delay, Some(response), true)
            }
            (0x3, 0x01) => {
                let records: Vec<u8> = {
                    let state = self.plc.state.lock().unwrap();
                    state
                        .block_counts
                        .iter()
                        .flat_map(|&(ty, count)| {
                            let mut record = vec![0x30, ty];
                            record.extend_from_slice(&count.to_be_bytes());
                            record
                        })
                        .collect()
                };
                let response =
                    self.user_data_frame(pdu_ref, group, subfunction, sequence, true, &records);
                (delay, Some(response), true)
            }
            (0x3, 0x02) => {
                assert_eq!(payload[0], 0x30, "list request without the ASCII marker");
                let records: Vec<u8> = {
                    let state = self.plc.state.lock().unwrap();
                    state
                        .blocks_of_type
                        .iter()
                        .flat_map(|&(number, flags, language)| {
                            let mut record = number.to_be_bytes().to_vec();
                            record.push(flags);
                            record.push(language);
                            record
                        })
                        .collect()
                };
                let response =
                    self.user_data_frame(pdu_ref, group, subfunction, sequence, true, &records);
                (delay, Some(response), true)
            }
            (0x3, 0x03) => {
                assert_eq!(payload.len(), 8, "block info request payload");
                let info = self.plc.state.lock().unwrap().block_info.clone();
                let response =
                    self.user_data_frame(pdu_ref, group, subfunction, sequence, true, &info);
                (delay, Some(response), true)
            }
            other => panic!("unexpected user data {:?}", other),
        }
    }

    fn user_data_frame(
        &mut self,
        pdu_ref: u16,
        group: u8,
        subfunction: u8,
        sequence: u8,
        last: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut param = vec![0x00, 0x01, 0x12, 0x08, 0x12];
        param.push(0x80 | group);
        param.push(subfunction);
        param.push(sequence.wrapping_add(1));
        param.push(1); // data unit reference
        param.push(if last { 0x01 } else { 0x00 });
        param.extend_from_slice(&[0x00, 0x00]);

        let mut data = vec![0xFF, 0x09];
        data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        data.extend_from_slice(payload);
        header(0x07, pdu_ref, &param, &data)
    }
}

/// Units per element and the byte address of an S7-ANY item.
fn item_location(item: &[u8]) -> (u8, u16, u16, u8, usize, u8) {
    let transport = item[3];
    let length = be16(&item[4..]);
    let db = be16(&item[6..]);
    let area = item[8];
    let addr24 =
        ((item[9] as usize) << 16) | ((item[10] as usize) << 8) | item[11] as usize;
    let (byte_addr, bit) = match transport {
        0x1C | 0x1D => (addr24 * 2, 0),
        0x01 => (addr24 >> 3, (addr24 & 7) as u8),
        _ => (addr24 >> 3, 0),
    };
    (transport, length, db, area, byte_addr, bit)
}

fn memory<'a>(state: &'a mut PlcState, area: u8, db: u16) -> &'a mut Vec<u8> {
    state.memory.entry((area, db)).or_insert_with(|| vec![0u8; 2048])
}

fn read_item(state: &mut PlcState, item: &[u8], last: bool, out: &mut Vec<u8>) {
    let (transport, length, db, area, byte_addr, _) = item_location(item);
    let addr24 = ((item[9] as u32) << 16) | ((item[10] as u32) << 8) | item[11] as u32;
    let logical_start = match transport {
        0x1C | 0x1D => addr24,
        _ => addr24 >> 3,
    };
    if state.fail_read_at == Some((area, db, logical_start)) {
        out.extend_from_slice(&[0x05, 0x00, 0x00, 0x00]);
        return;
    }
    let (byte_len, result_transport, bits) = match transport {
        0x1C | 0x1D => (length as usize * 2, 0x09, false),
        _ => (length as usize, 0x04, true),
    };
    let image = memory(state, area, db);
    let payload = &image[byte_addr..byte_addr + byte_len];
    out.push(0xFF);
    out.push(result_transport);
    let field = if bits { (byte_len as u16) << 3 } else { byte_len as u16 };
    out.extend_from_slice(&field.to_be_bytes());
    out.extend_from_slice(payload);
    if byte_len % 2 == 1 && !last {
        out.push(0x00);
    }
}

/// Applies one write data item, returning the cursor past it.
fn write_item(state: &mut PlcState, item: &[u8], data: &[u8], cursor: usize) -> usize {
    let (transport, _length, db, area, byte_addr, bit) = item_location(item);
    let ts = data[cursor + 1];
    let field = be16(&data[cursor + 2..]) as usize;
    let byte_len = match ts {
        0x03 | 0x09 | 0x07 | 0x00 => field,
        _ => field >> 3,
    };
    let payload = &data[cursor + 4..cursor + 4 + byte_len];

    if transport == 0x01 {
        let image = memory(state, area, db);
        for (k, &value) in payload.iter().enumerate() {
            let bit_index = bit as usize + k;
            let target = byte_addr + bit_index / 8;
            let mask = 1u8 << (bit_index % 8);
            if value != 0 {
                image[target] |= mask;
            } else {
                image[target] &= !mask;
            }
        }
    } else {
        let image = memory(state, area, db);
        image[byte_addr..byte_addr + byte_len].copy_from_slice(payload);
    }

    let mut next = cursor + 4 + byte_len;
    if byte_len % 2 == 1 && next < data.len() {
        next += 1; // padding between odd items
    }
    next
}
