// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Full-duplex request/response multiplexer over a framed transport.
//!
//! One task owns the transport and the whole connection state: it
//! negotiates the PDU size, allocates PDU references, enforces the
//! concurrency window with a FIFO overflow queue, demultiplexes answers
//! by reference, reassembles segmented user-data responses and applies
//! the per-job deadline. Callers talk to it through cloneable handles.

use crate::codec::{
    self, JobBody, ReadResult, RequestItem, ResponseBody, UserDataRequest,
};
use crate::constant::*;
use crate::error::Error;
use crate::item::{from_bcd, to_bcd};
use crate::transport::BoxedTransport;
use bytes::Bytes;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// Ceiling on the negotiated PDU size, whatever the caller proposes.
pub(crate) const MAX_PDU_SIZE: u16 = 960;

#[derive(Debug, Clone)]
pub(crate) struct ConnectionOptions {
    pub max_jobs: u16,
    pub max_pdu_size: u16,
    pub timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> ConnectionOptions {
        ConnectionOptions {
            max_jobs: 8,
            max_pdu_size: 480,
            timeout: Duration::from_millis(2000),
        }
    }
}

/// One entry of the block list service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockListEntry {
    pub number: u16,
    pub flags: u8,
    pub language: u8,
}

enum Command {
    Job {
        body: JobBody,
        reply: oneshot::Sender<Result<ResponseBody, Error>>,
    },
    Disconnect,
}

struct Job {
    body: JobBody,
    reply: oneshot::Sender<Result<ResponseBody, Error>>,
    deadline: Instant,
    /// Concatenated payloads of a segmented user-data exchange.
    acc: Vec<u8>,
}

impl Job {
    fn resolve(self, body: ResponseBody) {
        let _ = self.reply.send(Ok(body));
    }

    fn fail(self, error: Error) {
        let _ = self.reply.send(Err(error));
    }
}

struct Shared {
    pdu_size: AtomicU16,
    max_jobs: AtomicU16,
}

/// Handle to a live connection task. Cheap to clone; dropping every
/// handle tears the connection down.
#[derive(Clone)]
pub(crate) struct S7Connection {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<bool>,
}

impl S7Connection {
    /// Dials the S7 layer over an already connected transport: sends the
    /// communication setup job and waits for the negotiated parameters.
    pub(crate) async fn open(
        transport: BoxedTransport,
        options: ConnectionOptions,
    ) -> Result<S7Connection, Error> {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            pdu_size: AtomicU16::new(0),
            max_jobs: AtomicU16::new(0),
        });
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = ConnectionTask {
            transport,
            cmd_rx,
            shared: Arc::clone(&shared),
            options: options.clone(),
            next_ref: 1,
            outstanding: HashMap::new(),
            pending: VecDeque::new(),
            max_jobs: 1,
            closed_tx,
        };
        tokio::spawn(task.run(ready_tx));

        let connection = S7Connection {
            cmd_tx,
            shared,
            closed_rx,
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Interrupted),
        }
    }

    /// Negotiated PDU size, 0 before setup completed.
    pub(crate) fn pdu_size(&self) -> u16 {
        self.shared.pdu_size.load(Ordering::Acquire)
    }

    pub(crate) fn max_jobs(&self) -> u16 {
        self.shared.max_jobs.load(Ordering::Acquire)
    }

    /// Resolves once the connection task has terminated.
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
        self.closed().await;
    }

    async fn job(&self, body: JobBody) -> Result<ResponseBody, Error> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Job { body, reply })
            .await
            .map_err(|_| Error::NotConnected)?;
        rx.await.map_err(|_| Error::Interrupted)?
    }

    /// One ReadVar job; the result array is parallel to `items`.
    pub(crate) async fn request_read_vars(
        &self,
        items: Vec<RequestItem>,
    ) -> Result<Vec<ReadResult>, Error> {
        match self.job(JobBody::ReadVars(items)).await? {
            ResponseBody::ReadAck(results) => Ok(results),
            other => Err(unexpected("ReadAck", &other)),
        }
    }

    /// One WriteVar job; returns the per-item return codes.
    pub(crate) async fn request_write_vars(
        &self,
        items: Vec<RequestItem>,
        data: Vec<Bytes>,
    ) -> Result<Vec<u8>, Error> {
        if items.len() != data.len() {
            return Err(Error::InvalidArgument {
                reason: "write items and buffers must be parallel".to_string(),
            });
        }
        match self.job(JobBody::WriteVars(items, data)).await? {
            ResponseBody::WriteAck(codes) => Ok(codes),
            other => Err(unexpected("WriteAck", &other)),
        }
    }

    /// One user-data exchange, transparently continued across data
    /// units; returns the concatenated data portion.
    pub(crate) async fn send_user_data(
        &self,
        group: FunctionGroup,
        subfunction: u8,
        payload: Bytes,
    ) -> Result<Bytes, Error> {
        let body = JobBody::UserData(UserDataRequest {
            group,
            subfunction,
            sequence: 0,
            continuation: None,
            payload,
        });
        match self.job(body).await? {
            ResponseBody::UserData(res) => Ok(res.data),
            other => Err(unexpected("UserData", &other)),
        }
    }

    /// Block counts per type from the block-list service.
    pub(crate) async fn block_count(&self) -> Result<HashMap<BlockType, u16>, Error> {
        let data = self
            .send_user_data(FunctionGroup::Block, SUB_BLOCK_LIST, Bytes::new())
            .await?;
        let mut counts = HashMap::new();
        for record in data.chunks_exact(4) {
            let block_type = BlockType::from_u8(record[1])?;
            counts.insert(block_type, u16::from_be_bytes([record[2], record[3]]));
        }
        Ok(counts)
    }

    pub(crate) async fn list_blocks(
        &self,
        block_type: BlockType,
    ) -> Result<Vec<BlockListEntry>, Error> {
        let payload = Bytes::from(vec![0x30, block_type as u8]);
        let data = self
            .send_user_data(FunctionGroup::Block, SUB_BLOCK_LIST_OF_TYPE, payload)
            .await?;
        Ok(data
            .chunks_exact(4)
            .map(|record| BlockListEntry {
                number: u16::from_be_bytes([record[0], record[1]]),
                flags: record[2],
                language: record[3],
            })
            .collect())
    }

    /// Raw block-info envelope for one block of the given filesystem
    /// (`'A'` active, `'P'` passive, `'B'` both).
    pub(crate) async fn get_block_info(
        &self,
        block_type: BlockType,
        number: u32,
        filesystem: char,
    ) -> Result<Bytes, Error> {
        if number > 99999 {
            return Err(Error::InvalidArgument {
                reason: format!("block number {} has more than five digits", number),
            });
        }
        let mut payload = vec![0x30, block_type as u8];
        payload.extend_from_slice(format!("{:05}", number).as_bytes());
        payload.push(filesystem as u8);
        self.send_user_data(FunctionGroup::Block, SUB_BLOCK_INFO, Bytes::from(payload))
            .await
    }

    /// Runs the start/continue/end upload handshake and returns the
    /// concatenated block image. A failing intermediate step aborts the
    /// upload before the error is surfaced.
    pub(crate) async fn upload_block(&self, filename: &str) -> Result<Vec<u8>, Error> {
        let upload_id = match self
            .job(JobBody::StartUpload {
                filename: filename.to_string(),
            })
            .await?
        {
            ResponseBody::StartUploadAck { upload_id, .. } => upload_id,
            other => return Err(unexpected("StartUploadAck", &other)),
        };

        let mut image = Vec::new();
        loop {
            match self.job(JobBody::Upload { upload_id }).await {
                Ok(ResponseBody::UploadAck { more_follows, data }) => {
                    image.extend_from_slice(&data);
                    if !more_follows {
                        break;
                    }
                }
                Ok(other) => {
                    self.abort_upload(upload_id).await;
                    return Err(unexpected("UploadAck", &other));
                }
                Err(e) => {
                    self.abort_upload(upload_id).await;
                    return Err(e);
                }
            }
        }

        match self.job(JobBody::EndUpload { upload_id, abort: false }).await? {
            ResponseBody::EndUploadAck => Ok(image),
            other => Err(unexpected("EndUploadAck", &other)),
        }
    }

    async fn abort_upload(&self, upload_id: u32) {
        let _ = self.job(JobBody::EndUpload { upload_id, abort: true }).await;
    }

    /// Reads the controller clock.
    pub(crate) async fn get_time(&self) -> Result<NaiveDateTime, Error> {
        let data = self
            .send_user_data(FunctionGroup::Time, SUB_TIME_READ_CLOCK, Bytes::new())
            .await?;
        decode_clock(&data)
    }

    /// Sets the controller clock.
    pub(crate) async fn set_time(&self, time: NaiveDateTime) -> Result<(), Error> {
        self.send_user_data(FunctionGroup::Time, SUB_TIME_SET_CLOCK, encode_clock(&time))
            .await?;
        Ok(())
    }
}

fn unexpected(wanted: &str, got: &ResponseBody) -> Error {
    Error::UnexpectedResponse {
        reason: format!("wanted {}, got {:?}", wanted, got),
    }
}

/// 10-byte clock payload: reserved, BCD century, then BCD
/// year/month/day/hour/minute/second and milliseconds with the weekday
/// in the last nibble.
fn decode_clock(data: &[u8]) -> Result<NaiveDateTime, Error> {
    if data.len() < 10 {
        return Err(Error::UnexpectedResponse {
            reason: format!("clock payload of {} bytes", data.len()),
        });
    }
    let year = from_bcd(data[1])? as i32 * 100 + from_bcd(data[2])? as i32;
    let month = from_bcd(data[3])? as u32;
    let day = from_bcd(data[4])? as u32;
    let hour = from_bcd(data[5])? as u32;
    let minute = from_bcd(data[6])? as u32;
    let second = from_bcd(data[7])? as u32;
    let msec = from_bcd(data[8])? as u32 * 10 + u32::from(data[9] >> 4);
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_milli_opt(hour, minute, second, msec))
        .ok_or_else(|| Error::UnexpectedResponse {
            reason: "clock fields out of range".to_string(),
        })
}

fn encode_clock(time: &NaiveDateTime) -> Bytes {
    let msec = time.and_utc().timestamp_subsec_millis();
    let payload = vec![
        0x00,
        to_bcd((time.year() / 100) as u8),
        to_bcd((time.year() % 100) as u8),
        to_bcd(time.month() as u8),
        to_bcd(time.day() as u8),
        to_bcd(time.hour() as u8),
        to_bcd(time.minute() as u8),
        to_bcd(time.second() as u8),
        to_bcd((msec / 10) as u8),
        (((msec % 10) as u8) << 4) | (time.weekday().number_from_sunday() as u8),
    ];
    Bytes::from(payload)
}

struct ConnectionTask {
    transport: BoxedTransport,
    cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    options: ConnectionOptions,
    next_ref: u16,
    outstanding: HashMap<u16, Job>,
    pending: VecDeque<Job>,
    max_jobs: usize,
    closed_tx: watch::Sender<bool>,
}

enum Exit {
    /// User asked, or every handle is gone.
    Disconnect,
    /// A job deadline elapsed; the controller offers no cancel, so the
    /// whole connection is poisoned.
    Timeout,
    /// The transport failed or the peer sent garbage.
    Broken(Error),
}

impl ConnectionTask {
    async fn run(mut self, ready: oneshot::Sender<Result<(), Error>>) {
        let mut ready = Some(ready);
        let setup = JobBody::Setup {
            max_amq_caller: self.options.max_jobs,
            max_amq_callee: self.options.max_jobs,
            pdu_size: self.options.max_pdu_size.min(MAX_PDU_SIZE),
        };
        let (setup_tx, setup_rx) = oneshot::channel();
        self.enqueue(Job {
            body: setup,
            reply: setup_tx,
            deadline: Instant::now() + self.options.timeout,
            acc: Vec::new(),
        });

        let mut setup_rx = Some(setup_rx);
        let exit = self.event_loop(&mut ready, &mut setup_rx).await;

        match &exit {
            Exit::Disconnect => debug!("connection closing"),
            Exit::Timeout => warn!("job deadline elapsed, poisoning connection"),
            Exit::Broken(e) => warn!(error = %e, "connection broken"),
        }

        // Coarse cancellation: teardown fails every queued and in-flight
        // job alike.
        for (_, job) in self.outstanding.drain() {
            job.fail(Error::Interrupted);
        }
        for job in self.pending.drain(..) {
            job.fail(Error::Interrupted);
        }
        if let Some(ready) = ready.take() {
            let _ = ready.send(Err(match exit {
                Exit::Timeout => Error::Timeout,
                Exit::Broken(e) => e,
                Exit::Disconnect => Error::Interrupted,
            }));
        }
        let _ = self.closed_tx.send(true);
    }

    async fn event_loop(
        &mut self,
        ready: &mut Option<oneshot::Sender<Result<(), Error>>>,
        setup_reply: &mut Option<oneshot::Receiver<Result<ResponseBody, Error>>>,
    ) -> Exit {
        loop {
            if let Err(e) = self.pump().await {
                return Exit::Broken(e);
            }

            // the setup answer is consumed here instead of by a caller
            let setup_result = setup_reply
                .as_mut()
                .and_then(|rx| rx.try_recv().ok());
            if let Some(result) = setup_result {
                *setup_reply = None;
                match self.finish_setup(result) {
                    Ok(()) => {
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(Ok(()));
                        }
                    }
                    Err(e) => return Exit::Broken(e),
                }
            }

            let deadline = self.earliest_deadline();
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    None | Some(Command::Disconnect) => return Exit::Disconnect,
                    Some(Command::Job { body, reply }) => {
                        self.enqueue(Job {
                            body,
                            reply,
                            deadline: Instant::now() + self.options.timeout,
                            acc: Vec::new(),
                        });
                    }
                },
                frame = self.transport.recv() => match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.dispatch(frame) {
                            return Exit::Broken(e);
                        }
                    }
                    Ok(None) => return Exit::Broken(Error::Iso {
                        reason: "transport closed by peer".to_string(),
                    }),
                    Err(e) => return Exit::Broken(e),
                },
                _ = wait_deadline(deadline) => {
                    self.fail_expired();
                    return Exit::Timeout;
                }
            }
        }
    }

    fn finish_setup(&mut self, result: Result<ResponseBody, Error>) -> Result<(), Error> {
        match result? {
            ResponseBody::SetupAck {
                max_amq_caller,
                max_amq_callee,
                pdu_size,
            } => {
                if pdu_size == 0 {
                    return Err(Error::UnexpectedResponse {
                        reason: "peer negotiated a zero PDU size".to_string(),
                    });
                }
                let pdu_size = negotiated_pdu_size(pdu_size, self.options.max_pdu_size);
                let window = self
                    .options
                    .max_jobs
                    .min(max_amq_caller.max(1))
                    .min(max_amq_callee.max(1))
                    .max(1);
                self.max_jobs = window as usize;
                self.shared.pdu_size.store(pdu_size, Ordering::Release);
                self.shared.max_jobs.store(window, Ordering::Release);
                debug!(pdu_size, window, "communication set up");
                Ok(())
            }
            other => Err(unexpected("SetupAck", &other)),
        }
    }

    fn enqueue(&mut self, job: Job) {
        self.pending.push_back(job);
    }

    /// Drains the FIFO queue into the window.
    async fn pump(&mut self) -> Result<(), Error> {
        while self.outstanding.len() < self.max_jobs {
            let Some(job) = self.pending.pop_front() else {
                return Ok(());
            };
            let pdu_ref = self.alloc_ref();
            let frame = codec::serialize_request(pdu_ref, &job.body);
            trace!(pdu_ref, "job sent");
            self.outstanding.insert(pdu_ref, job);
            self.transport.send(frame).await?;
        }
        Ok(())
    }

    fn alloc_ref(&mut self) -> u16 {
        next_reference(&mut self.next_ref, |r| self.outstanding.contains_key(&r))
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.outstanding
            .values()
            .chain(self.pending.iter())
            .map(|job| job.deadline)
            .min()
    }

    fn fail_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .outstanding
            .iter()
            .filter(|(_, job)| job.deadline <= now)
            .map(|(&r, _)| r)
            .collect();
        for pdu_ref in expired {
            if let Some(job) = self.outstanding.remove(&pdu_ref) {
                job.fail(Error::Timeout);
            }
        }
        while let Some(position) = self.pending.iter().position(|job| job.deadline <= now) {
            if let Some(job) = self.pending.remove(position) {
                job.fail(Error::Timeout);
            }
        }
    }

    fn dispatch(&mut self, frame: Bytes) -> Result<(), Error> {
        let pdu = codec::parse_response(frame)?;
        let Some(job) = self.outstanding.remove(&pdu.pdu_ref) else {
            warn!(pdu_ref = pdu.pdu_ref, "answer for unknown reference dropped");
            return Ok(());
        };
        trace!(pdu_ref = pdu.pdu_ref, "job answered");

        let body = match pdu.body {
            Ok(body) => body,
            Err(e) => {
                job.fail(e);
                return Ok(());
            }
        };
        match body {
            ResponseBody::UserData(res) => self.on_user_data(job, res),
            body => {
                if kinds_match(&job.body, &body) {
                    job.resolve(body);
                } else {
                    let err = unexpected(job_kind(&job.body), &body);
                    job.fail(err);
                }
            }
        }
        Ok(())
    }

    /// Buffers one data unit; answers with a continuation request until
    /// the last unit arrives, then resolves the job with the
    /// concatenated payload.
    fn on_user_data(&mut self, mut job: Job, res: codec::UserDataResponse) {
        let (group, subfunction) = match &job.body {
            JobBody::UserData(request) => (request.group, request.subfunction),
            _ => {
                let err = unexpected(job_kind(&job.body), &ResponseBody::UserData(res));
                job.fail(err);
                return;
            }
        };
        if res.error_code != 0 {
            job.fail(Error::PlcError {
                class: (res.error_code >> 8) as u8,
                code: res.error_code as u8,
            });
            return;
        }
        if res.return_code != RC_DATA_OK && res.return_code != RC_NO_DATA {
            job.fail(Error::ReturnCode {
                code: res.return_code,
                context: format!(
                    "user data group {:?} subfunction 0x{:02X}",
                    res.group, res.subfunction
                ),
            });
            return;
        }

        job.acc.extend_from_slice(&res.data);
        if res.last_data_unit {
            let mut complete = res;
            complete.data = Bytes::from(std::mem::take(&mut job.acc));
            job.resolve(ResponseBody::UserData(complete));
            return;
        }

        trace!(
            sequence = res.sequence,
            unit = res.data_unit_ref,
            "user data continued"
        );
        job.body = JobBody::UserData(UserDataRequest {
            group,
            subfunction,
            sequence: res.sequence,
            continuation: Some(res.data_unit_ref),
            payload: Bytes::new(),
        });
        // continuations jump the queue so interleaved exchanges cannot
        // starve a half-read answer
        self.pending.push_front(job);
    }
}

/// The smaller of both sides' proposal, bounded by the library ceiling.
fn negotiated_pdu_size(answered: u16, proposed: u16) -> u16 {
    answered.min(proposed).min(MAX_PDU_SIZE)
}

/// Monotonic 16-bit counter skipping 0 and, on wrap, references that are
/// still outstanding.
fn next_reference(counter: &mut u16, in_use: impl Fn(u16) -> bool) -> u16 {
    loop {
        let candidate = *counter;
        *counter = counter.checked_add(1).unwrap_or(1);
        if candidate != 0 && !in_use(candidate) {
            return candidate;
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn kinds_match(job: &JobBody, response: &ResponseBody) -> bool {
    matches!(
        (job, response),
        (JobBody::Setup { .. }, ResponseBody::SetupAck { .. })
            | (JobBody::ReadVars(_), ResponseBody::ReadAck(_))
            | (JobBody::WriteVars(..), ResponseBody::WriteAck(_))
            | (JobBody::UserData(_), ResponseBody::UserData(_))
            | (JobBody::StartUpload { .. }, ResponseBody::StartUploadAck { .. })
            | (JobBody::Upload { .. }, ResponseBody::UploadAck { .. })
            | (JobBody::EndUpload { .. }, ResponseBody::EndUploadAck)
    )
}

fn job_kind(job: &JobBody) -> &'static str {
    match job {
        JobBody::Setup { .. } => "SetupAck",
        JobBody::ReadVars(_) => "ReadAck",
        JobBody::WriteVars(..) => "WriteAck",
        JobBody::UserData(_) => "UserData",
        JobBody::StartUpload { .. } => "StartUploadAck",
        JobBody::Upload { .. } => "UploadAck",
        JobBody::EndUpload { .. } => "EndUploadAck",
    }
}

#[test]
fn test_pdu_size_negotiation_is_capped() {
    assert_eq!(negotiated_pdu_size(480, 480), 480);
    assert_eq!(negotiated_pdu_size(240, 480), 240);
    assert_eq!(negotiated_pdu_size(960, 480), 480);
    // peer and caller both offering more than the ceiling get capped
    assert_eq!(negotiated_pdu_size(2048, 4096), 960);
    assert_eq!(negotiated_pdu_size(960, 2048), 960);
}

#[test]
fn test_reference_allocation() {
    let mut counter = 1u16;
    let free = |_| false;
    assert_eq!(next_reference(&mut counter, free), 1);
    assert_eq!(next_reference(&mut counter, free), 2);

    // wrapping skips 0
    let mut counter = u16::MAX;
    assert_eq!(next_reference(&mut counter, free), u16::MAX);
    assert_eq!(next_reference(&mut counter, free), 1);

    // wrapping also skips references still in flight
    let mut counter = u16::MAX;
    let in_use = |r: u16| r == u16::MAX || r == 1 || r == 2;
    assert_eq!(next_reference(&mut counter, in_use), 3);
}

#[test]
fn test_clock_codec() {
    let dt = NaiveDate::from_ymd_opt(2023, 11, 7)
        .unwrap()
        .and_hms_milli_opt(8, 30, 15, 120)
        .unwrap();
    let payload = encode_clock(&dt);
    assert_eq!(
        &payload[..],
        &[0x00, 0x20, 0x23, 0x11, 0x07, 0x08, 0x30, 0x15, 0x12, 0x03]
    );
    assert_eq!(decode_clock(&payload).unwrap(), dt);
}
