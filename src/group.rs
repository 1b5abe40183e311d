// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Groups of named variables read together through packed, coalesced
//! ReadVar jobs

use crate::address::{Address, DataType};
use crate::client::Client;
use crate::codec::RequestItem;
use crate::constant::{
    Area, RC_DATA_OK, REQ_HEADER_SIZE, REQ_PART_SIZE, RES_HEADER_SIZE, RES_PART_OVERHEAD,
    READ_OVERHEAD, WL_BYTE, WL_COUNTER, WL_TIMER, WRITE_ITEM_OVERHEAD, WRITE_REQ_OVERHEAD,
};
use crate::error::Error;
use crate::item::{CopyDescriptor, Item, Value};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;

/// Maps symbolic tag names to address strings before parsing.
pub type TranslationCallback = Box<dyn Fn(&str) -> String + Send + Sync>;

/// One read window of a packet: a contiguous range of one area/db that
/// one or more items scatter out of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadPart {
    pub area: Area,
    pub db_number: u16,
    pub transport: u8,
    /// Start in address units: bytes, or elements for timers/counters.
    pub start: u32,
    /// Length in address units.
    pub units: u32,
    /// Bytes of one address unit (2 for timers/counters).
    pub unit_size: usize,
    /// Member items with their scatter descriptors for this window.
    pub copies: Vec<(String, CopyDescriptor)>,
}

impl ReadPart {
    pub(crate) fn response_bytes(&self) -> usize {
        self.units as usize * self.unit_size
    }

    pub(crate) fn request_item(&self) -> RequestItem {
        RequestItem {
            transport: self.transport,
            length: self.units as u16,
            db_number: self.db_number,
            area: self.area,
            byte_offset: self.start,
            bit_offset: 0,
        }
    }

    fn describe(&self) -> String {
        self.request_item().describe()
    }
}

/// One ReadVar job worth of parts, sized to the negotiated PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadPacket {
    pub parts: Vec<ReadPart>,
    request_len: usize,
    response_len: usize,
}

impl ReadPacket {
    fn new() -> ReadPacket {
        ReadPacket {
            parts: Vec::new(),
            request_len: REQ_HEADER_SIZE,
            response_len: RES_HEADER_SIZE,
        }
    }

    fn has_room_for_part(&self, unit_size: usize, max_payload: usize) -> bool {
        self.request_len + REQ_PART_SIZE <= max_payload
            && self.response_len + RES_PART_OVERHEAD + unit_size <= max_payload
    }

    fn payload_capacity(&self, max_payload: usize) -> usize {
        max_payload - self.response_len - RES_PART_OVERHEAD
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Plan {
    pdu_size: u16,
    packets: Vec<ReadPacket>,
}

/// A keyed set of items polled and written together. The read plan is
/// cached and rebuilt whenever the item set or the negotiated PDU size
/// changes.
pub struct ItemGroup {
    client: Client,
    items: HashMap<String, Item>,
    plan: Option<Plan>,
    translator: Option<TranslationCallback>,
    skip_optimization: bool,
    optimization_gap: usize,
}

impl ItemGroup {
    pub fn new(client: &Client) -> ItemGroup {
        let (skip_optimization, optimization_gap) = client.optimization_options();
        ItemGroup {
            client: client.clone(),
            items: HashMap::new(),
            plan: None,
            translator: None,
            skip_optimization,
            optimization_gap,
        }
    }

    /// Installs a tag-name rewriter applied before address parsing.
    pub fn set_translation_callback(&mut self, callback: TranslationCallback) {
        self.translator = Some(callback);
    }

    fn resolve(&self, tag: &str) -> Result<Item, Error> {
        let address = match &self.translator {
            Some(translate) => Address::parse(&translate(tag))?,
            None => Address::parse(tag)?,
        };
        Ok(Item::new(tag.to_string(), address))
    }

    /// Parses and adds tags; existing tags of the same name are
    /// replaced.
    pub fn add_items<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<(), Error> {
        for tag in tags {
            let item = self.resolve(tag.as_ref())?;
            self.items.insert(tag.as_ref().to_string(), item);
        }
        self.plan = None;
        Ok(())
    }

    pub fn remove_items<S: AsRef<str>>(&mut self, tags: &[S]) {
        for tag in tags {
            self.items.remove(tag.as_ref());
        }
        self.plan = None;
    }

    /// Drops every item and the cached plan.
    pub fn clear(&mut self) {
        self.items.clear();
        self.plan = None;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn ensure_plan(&mut self, pdu_size: u16) -> Result<(), Error> {
        if let Some(plan) = &self.plan {
            if plan.pdu_size == pdu_size {
                return Ok(());
            }
        }
        let items: Vec<&Item> = self.items.values().collect();
        let packets = plan_read(
            &items,
            pdu_size,
            self.optimization_gap,
            self.skip_optimization,
        )?;
        debug!(
            items = items.len(),
            packets = packets.len(),
            pdu_size,
            "read plan rebuilt"
        );
        self.plan = Some(Plan { pdu_size, packets });
        Ok(())
    }

    /// Reads every item of the group in as few jobs as the PDU size
    /// allows, issued in parallel, and returns the decoded values keyed
    /// by tag name. The first failing part aborts the batch.
    pub async fn read_all(&mut self) -> Result<HashMap<String, Value>, Error> {
        if self.items.is_empty() {
            return Ok(HashMap::new());
        }
        let connection = self.client.connection()?;
        let pdu_size = connection.pdu_size();
        if pdu_size == 0 {
            return Err(Error::IllegalState {
                reason: "pdu size not negotiated yet",
            });
        }
        self.ensure_plan(pdu_size)?;
        let plan = self.plan.as_ref().expect("plan was just built");

        let mut jobs = Vec::with_capacity(plan.packets.len());
        for packet in &plan.packets {
            let connection = connection.clone();
            let parts: Vec<RequestItem> = packet.parts.iter().map(ReadPart::request_item).collect();
            jobs.push(tokio::spawn(async move {
                connection.request_read_vars(parts).await
            }));
        }
        let mut answers = Vec::with_capacity(jobs.len());
        for job in jobs {
            answers.push(job.await.map_err(|_| Error::Interrupted)??);
        }

        for (packet, results) in plan.packets.iter().zip(&answers) {
            if results.len() != packet.parts.len() {
                return Err(Error::UnexpectedResponse {
                    reason: format!(
                        "{} results for {} requested parts",
                        results.len(),
                        packet.parts.len()
                    ),
                });
            }
            for (part, result) in packet.parts.iter().zip(results) {
                if result.code != RC_DATA_OK {
                    return Err(Error::ReturnCode {
                        code: result.code,
                        context: part.describe(),
                    });
                }
                if result.data.len() < part.response_bytes() {
                    return Err(Error::UnexpectedResponse {
                        reason: format!(
                            "part {} answered {} of {} bytes",
                            part.describe(),
                            result.data.len(),
                            part.response_bytes()
                        ),
                    });
                }
                for (name, copy) in &part.copies {
                    if let Some(item) = self.items.get_mut(name) {
                        item.copy_from(&result.data, *copy);
                    }
                }
            }
        }

        let mut values = HashMap::with_capacity(self.items.len());
        for (name, item) in &self.items {
            values.insert(name.clone(), item.update_value()?);
        }
        Ok(values)
    }

    /// Writes values to tags. Tags need not have been added; unknown
    /// ones get a throwaway item for the call. Writes are packed into
    /// PDU-sized WriteVar jobs but single items are never split.
    pub async fn write_items<S: AsRef<str>>(
        &mut self,
        tags: &[S],
        values: &[Value],
    ) -> Result<(), Error> {
        if tags.len() != values.len() {
            return Err(Error::InvalidArgument {
                reason: "tags and values must be parallel".to_string(),
            });
        }
        if tags.is_empty() {
            return Ok(());
        }
        let connection = self.client.connection()?;
        let pdu_size = connection.pdu_size() as usize;
        if pdu_size == 0 {
            return Err(Error::IllegalState {
                reason: "pdu size not negotiated yet",
            });
        }
        let budget = pdu_size - WRITE_REQ_OVERHEAD;

        struct WritePacket {
            parts: Vec<RequestItem>,
            buffers: Vec<Bytes>,
            used: usize,
        }
        let mut packets: Vec<WritePacket> = Vec::new();

        for (tag, value) in tags.iter().zip(values) {
            let tag = tag.as_ref();
            let scratch;
            let item = match self.items.get(tag) {
                Some(item) => item,
                None => {
                    scratch = self.resolve(tag)?;
                    &scratch
                }
            };
            let fill = item.address().byte_length_with_fill();
            if WRITE_ITEM_OVERHEAD + fill > budget {
                return Err(Error::ItemTooBig {
                    name: tag.to_string(),
                    size: fill,
                    max: budget - WRITE_ITEM_OVERHEAD,
                });
            }
            let mut buffer = item.write_buffer(value)?;
            buffer.truncate(item.address().write_byte_length());

            let needs_new = match packets.last() {
                Some(packet) => packet.used + WRITE_ITEM_OVERHEAD + fill > budget,
                None => true,
            };
            if needs_new {
                packets.push(WritePacket {
                    parts: Vec::new(),
                    buffers: Vec::new(),
                    used: 0,
                });
            }
            let packet = packets.last_mut().expect("packet was just pushed");
            packet.parts.push(item.write_request());
            packet.buffers.push(Bytes::from(buffer));
            packet.used += WRITE_ITEM_OVERHEAD + fill;
        }

        let mut jobs = Vec::with_capacity(packets.len());
        let mut contexts = Vec::with_capacity(packets.len());
        for packet in packets {
            contexts.push(
                packet
                    .parts
                    .iter()
                    .map(RequestItem::describe)
                    .collect::<Vec<_>>(),
            );
            let connection = connection.clone();
            jobs.push(tokio::spawn(async move {
                connection
                    .request_write_vars(packet.parts, packet.buffers)
                    .await
            }));
        }
        for (job, contexts) in jobs.into_iter().zip(contexts) {
            let codes = job.await.map_err(|_| Error::Interrupted)??;
            for (code, context) in codes.iter().zip(contexts) {
                if *code != RC_DATA_OK {
                    return Err(Error::ReturnCode {
                        code: *code,
                        context,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Address units of one item: `(unit size in bytes, start, length)`.
fn item_units(item: &Item) -> (usize, u32, u32) {
    match item.address().data_type {
        DataType::Timer | DataType::Counter => (
            2,
            item.address().byte_offset,
            item.address().length as u32,
        ),
        _ => (1, item.address().byte_offset, item.byte_length() as u32),
    }
}

fn part_transport(area: Area) -> u8 {
    match area {
        Area::Timer => WL_TIMER,
        Area::Counter => WL_COUNTER,
        _ => WL_BYTE,
    }
}

/// Sort + pack + coalesce planner. Deterministic for a given item set
/// and PDU size.
pub(crate) fn plan_read(
    items: &[&Item],
    pdu_size: u16,
    gap: usize,
    skip_optimization: bool,
) -> Result<Vec<ReadPacket>, Error> {
    let pdu_size = pdu_size as usize;
    if pdu_size <= READ_OVERHEAD + RES_HEADER_SIZE + RES_PART_OVERHEAD + 1 {
        return Err(Error::IllegalState {
            reason: "pdu size too small to plan reads",
        });
    }
    let max_payload = pdu_size - READ_OVERHEAD;
    let fresh_capacity = max_payload - RES_HEADER_SIZE - RES_PART_OVERHEAD;

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        let (a, b) = (items[a], items[b]);
        (a.address().area as u8)
            .cmp(&(b.address().area as u8))
            .then(a.address().db_number.cmp(&b.address().db_number))
            .then(a.address().byte_offset.cmp(&b.address().byte_offset))
            .then(a.address().bit_offset.cmp(&b.address().bit_offset))
            // larger covering windows first so smaller ones coalesce in
            .then(b.byte_length().cmp(&a.byte_length()))
            .then(a.name().cmp(b.name()))
    });

    // spans of open parts per packet, in units, parallel to the packets'
    // part lists
    struct Span {
        end: u32,
        members: Vec<usize>,
    }
    let mut packets: Vec<ReadPacket> = Vec::new();
    let mut spans: Vec<Vec<Span>> = Vec::new();

    for &index in &order {
        let item = items[index];
        let address = item.address();
        let (unit_size, start, length) = item_units(item);

        // coalesce into the open part when the window allows
        if !skip_optimization && unit_size == 1 && address.area.is_optimizable() {
            if let (Some(packet), Some(parts)) = (packets.last_mut(), spans.last_mut()) {
                if let (Some(part), Some(span)) = (packet.parts.last_mut(), parts.last_mut()) {
                    let same_slot = part.area == address.area
                        && part.db_number == address.db_number
                        && part.unit_size == 1;
                    // negative distance means the window already covers
                    // (part of) the item; the sort guarantees the wider
                    // window came first
                    let distance = i64::from(start) - i64::from(span.end);
                    if same_slot && distance < gap as i64 {
                        let new_end = span.end.max(start + length);
                        let growth = (new_end - span.end) as usize;
                        if packet.response_len + growth <= max_payload {
                            span.end = new_end;
                            span.members.push(index);
                            part.units = new_end - part.start;
                            packet.response_len += growth;
                            continue;
                        }
                    }
                }
            }
        }

        let mut cursor = start;
        let mut remaining = length;
        while remaining > 0 {
            let need_bytes = remaining as usize * unit_size;
            let has_room = packets
                .last()
                .map(|p| p.has_room_for_part(unit_size, max_payload))
                .unwrap_or(false);
            if !has_room {
                packets.push(ReadPacket::new());
                spans.push(Vec::new());
            }
            let packet = packets.last_mut().expect("packet exists");
            let capacity = packet.payload_capacity(max_payload);

            let take = if need_bytes <= capacity {
                remaining
            } else if need_bytes <= fresh_capacity {
                // fits a packet of its own; do not fragment it here
                packets.push(ReadPacket::new());
                spans.push(Vec::new());
                continue;
            } else {
                if address.data_type == DataType::Bool {
                    // bit windows never split
                    return Err(Error::ItemTooBig {
                        name: item.name().to_string(),
                        size: need_bytes,
                        max: fresh_capacity,
                    });
                }
                (capacity / unit_size) as u32
            };

            let packet = packets.last_mut().expect("packet exists");
            packet.parts.push(ReadPart {
                area: address.area,
                db_number: address.db_number,
                transport: part_transport(address.area),
                start: cursor,
                units: take,
                unit_size,
                copies: Vec::new(),
            });
            packet.request_len += REQ_PART_SIZE;
            packet.response_len += RES_PART_OVERHEAD + take as usize * unit_size;
            spans
                .last_mut()
                .expect("span list exists")
                .push(Span {
                    end: cursor + take,
                    members: vec![index],
                });
            cursor += take;
            remaining -= take;
        }
    }

    // turn member lists into per-part copy descriptors
    for (packet, parts) in packets.iter_mut().zip(&spans) {
        for (part, span) in packet.parts.iter_mut().zip(parts) {
            for &index in &span.members {
                let item = items[index];
                let copy = if part.unit_size == 1 {
                    item.copy_offsets(part.start, part.units as usize)
                } else {
                    element_copy(item, part)
                };
                if let Some(copy) = copy {
                    part.copies.push((item.name().to_string(), copy));
                }
            }
        }
    }
    Ok(packets)
}

/// Scatter descriptor for element-addressed parts (timers, counters).
fn element_copy(item: &Item, part: &ReadPart) -> Option<CopyDescriptor> {
    let item_start = item.address().byte_offset;
    let item_end = item_start + item.address().length as u32;
    let start = item_start.max(part.start);
    let end = item_end.min(part.start + part.units);
    if start >= end {
        return None;
    }
    Some(CopyDescriptor {
        source: (start - part.start) as usize * part.unit_size,
        dest: (start - item_start) as usize * part.unit_size,
        count: (end - start) as usize * part.unit_size,
    })
}

#[cfg(test)]
fn planner_item(tag: &str) -> Item {
    Item::new(tag.to_string(), Address::parse(tag).unwrap())
}

#[cfg(test)]
fn check_budgets(packets: &[ReadPacket], pdu_size: usize) {
    let max_payload = pdu_size - READ_OVERHEAD;
    for packet in packets {
        let response: usize = packet
            .parts
            .iter()
            .map(|p| p.response_bytes() + RES_PART_OVERHEAD)
            .sum::<usize>()
            + RES_HEADER_SIZE;
        let request = packet.parts.len() * REQ_PART_SIZE + REQ_HEADER_SIZE;
        assert!(response <= max_payload, "response {} > {}", response, max_payload);
        assert!(request <= max_payload, "request {} > {}", request, max_payload);
        assert_eq!(response, packet.response_len);
        assert_eq!(request, packet.request_len);
    }
}

#[test]
fn test_planner_coalesces_across_gap() {
    let a = planner_item("DB1,BYTE0");
    let b = planner_item("DB1,BYTE3");
    let packets = plan_read(&[&a, &b], 240, 5, false).unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].parts.len(), 1);
    let part = &packets[0].parts[0];
    assert_eq!(part.start, 0);
    assert_eq!(part.units, 4);
    assert_eq!(part.copies.len(), 2);
    assert_eq!(
        part.copies[0],
        ("DB1,BYTE0".to_string(), CopyDescriptor { source: 0, dest: 0, count: 1 })
    );
    assert_eq!(
        part.copies[1],
        ("DB1,BYTE3".to_string(), CopyDescriptor { source: 3, dest: 0, count: 1 })
    );
    check_budgets(&packets, 240);
}

#[test]
fn test_planner_rejects_coalesce_across_blocks() {
    let a = planner_item("DB1,BYTE0");
    let b = planner_item("DB2,BYTE0");
    let packets = plan_read(&[&a, &b], 240, 100, false).unwrap();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].parts.len(), 2);
}

#[test]
fn test_planner_gap_limit() {
    let a = planner_item("DB1,BYTE0");
    let b = planner_item("DB1,BYTE5");
    // distance from end of a (1) to b (5) equals 4 < 5: coalesce
    assert_eq!(plan_read(&[&a, &b], 240, 5, false).unwrap()[0].parts.len(), 1);
    // with gap 4 the distance is no longer inside the window
    assert_eq!(plan_read(&[&a, &b], 240, 4, false).unwrap()[0].parts.len(), 2);
}

#[test]
fn test_planner_skip_optimization() {
    let a = planner_item("DB1,BYTE0");
    let b = planner_item("DB1,BYTE1");
    let packets = plan_read(&[&a, &b], 240, 5, true).unwrap();
    assert_eq!(packets[0].parts.len(), 2);
}

#[test]
fn test_planner_splits_oversized_item() {
    let item = planner_item("MB0.500");
    let packets = plan_read(&[&item], 240, 5, false).unwrap();
    assert_eq!(packets.len(), 3);
    let total: usize = packets
        .iter()
        .flat_map(|p| p.parts.iter())
        .map(ReadPart::response_bytes)
        .sum();
    assert_eq!(total, 500);
    // windows tile M[0..500) in order
    let mut cursor = 0;
    for part in packets.iter().flat_map(|p| p.parts.iter()) {
        assert_eq!(part.start, cursor);
        cursor += part.units;
    }
    assert_eq!(cursor, 500);
    // scattered bytes land back to back in the item buffer
    let mut covered = 0;
    for part in packets.iter().flat_map(|p| p.parts.iter()) {
        let (_, copy) = &part.copies[0];
        assert_eq!(copy.dest, covered);
        covered += copy.count;
    }
    assert_eq!(covered, 500);
    check_budgets(&packets, 240);
}

#[test]
fn test_planner_single_packet_when_items_fit() {
    let a = planner_item("DB1,WORD0");
    let b = planner_item("DB1,REAL100");
    let c = planner_item("M40.1");
    let packets = plan_read(&[&a, &b, &c], 480, 5, false).unwrap();
    assert_eq!(packets.len(), 1);
    check_budgets(&packets, 480);
}

#[test]
fn test_planner_is_deterministic() {
    let items: Vec<Item> = (0..40)
        .map(|i| planner_item(&format!("DB{},INT{}", i % 3, (i / 3) * 7)))
        .collect();
    let refs: Vec<&Item> = items.iter().collect();
    let mut shuffled = refs.clone();
    shuffled.rotate_left(17);
    let first = plan_read(&refs, 240, 5, false).unwrap();
    let second = plan_read(&shuffled, 240, 5, false).unwrap();
    assert_eq!(first, second);
    check_budgets(&first, 240);
}

#[test]
fn test_planner_covers_every_item() {
    let items = vec![
        planner_item("DB1,BYTE0.10"),
        planner_item("DB1,WORD4"),
        planner_item("DB1,X2.5"),
        planner_item("DB9,REAL0.30"),
        planner_item("T3"),
        planner_item("C0.2"),
        planner_item("IW10"),
    ];
    let refs: Vec<&Item> = items.iter().collect();
    let packets = plan_read(&refs, 240, 5, false).unwrap();
    check_budgets(&packets, 240);
    for item in &items {
        let covered: usize = packets
            .iter()
            .flat_map(|p| p.parts.iter())
            .flat_map(|p| p.copies.iter())
            .filter(|(name, _)| name == item.name())
            .map(|(_, copy)| copy.count)
            .sum();
        assert_eq!(covered, item.byte_length(), "item {}", item.name());
    }
}

#[test]
fn test_planner_bit_member_forces_byte_window() {
    let bit = planner_item("DB1,X2.5");
    let byte = planner_item("DB1,BYTE0");
    let packets = plan_read(&[&byte, &bit], 240, 5, false).unwrap();
    let part = &packets[0].parts[0];
    assert_eq!(part.transport, WL_BYTE);
    assert_eq!(part.start, 0);
    assert_eq!(part.units, 3);
    assert_eq!(part.copies.len(), 2);
}

#[test]
fn test_planner_timer_parts() {
    let timers = planner_item("T0.3");
    let packets = plan_read(&[&timers], 240, 5, false).unwrap();
    let part = &packets[0].parts[0];
    assert_eq!(part.transport, WL_TIMER);
    assert_eq!(part.unit_size, 2);
    assert_eq!(part.units, 3);
    assert_eq!(part.response_bytes(), 6);
    assert_eq!(
        part.copies[0].1,
        CopyDescriptor { source: 0, dest: 0, count: 6 }
    );
}

