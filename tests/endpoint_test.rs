mod common;

use chrono::NaiveDate;
use common::MockPlc;
use s7comm::{BlockType, Client, CpuState, Event, Options};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn client_for(plc: &MockPlc) -> Client {
    let mut options = Options::new("mock");
    options.custom_transport = Some(plc.factory());
    options.auto_reconnect = Duration::ZERO;
    Client::new(options)
}

async fn next_event(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event within two seconds")
        .expect("event stream closed")
}

fn ssl_payload(id: u16, entry_length: u16, entries: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&id.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&entry_length.to_be_bytes());
    payload.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for entry in entries {
        assert_eq!(entry.len(), entry_length as usize);
        payload.extend_from_slice(entry);
    }
    payload
}

fn ident_entry(index: u16, text: &str) -> Vec<u8> {
    let mut entry = index.to_be_bytes().to_vec();
    let mut name = [0u8; 32];
    name[..text.len()].copy_from_slice(text.as_bytes());
    entry.extend_from_slice(&name);
    entry
}

#[tokio::test]
async fn endpoint_reconnects_and_renegotiates() {
    let plc = MockPlc::new();
    plc.with(|state| state.drop_connections = 1);
    let client = {
        let mut options = Options::new("mock");
        options.custom_transport = Some(plc.factory());
        options.auto_reconnect = Duration::from_millis(100);
        Client::new(options)
    };
    let mut events = client.subscribe();
    client.connect().await.unwrap();

    assert!(matches!(next_event(&mut events).await, Event::Connecting));
    assert!(matches!(next_event(&mut events).await, Event::Connect));
    assert!(matches!(next_event(&mut events).await, Event::PduSize(480)));
    // the controller closes right after setup
    assert!(matches!(next_event(&mut events).await, Event::Disconnect));
    // and the endpoint dials again after the configured delay
    assert!(matches!(next_event(&mut events).await, Event::Connecting));
    assert!(matches!(next_event(&mut events).await, Event::Connect));
    assert!(matches!(next_event(&mut events).await, Event::PduSize(480)));

    assert_eq!(plc.counters.connections.load(Ordering::SeqCst), 2);
    assert!(client.is_connected());

    client.disconnect().await;
    assert!(matches!(next_event(&mut events).await, Event::Disconnect));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn disconnect_disables_reconnection() {
    let plc = MockPlc::new();
    let client = {
        let mut options = Options::new("mock");
        options.custom_transport = Some(plc.factory());
        options.auto_reconnect = Duration::from_millis(50);
        Client::new(options)
    };
    client.connect().await.unwrap();
    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(plc.counters.connections.load(Ordering::SeqCst), 1);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn segmented_ssl_answers_are_reassembled() {
    let plc = MockPlc::new();
    let entries = vec![
        ident_entry(1, "PLC STATION"),
        ident_entry(2, "CPU 315-2DP"),
        ident_entry(5, "S C-X4U421302009"),
        ident_entry(7, "6ES7 315-2AG10-0AB0"),
    ];
    plc.with(|state| {
        state.ssl.insert(0x001C, ssl_payload(0x001C, 34, &entries));
        state.ssl_segment_size = Some(40);
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let info = client.get_component_identification().await.unwrap();
    assert_eq!(info.as_name, "PLC STATION");
    assert_eq!(info.module_name, "CPU 315-2DP");
    assert_eq!(info.serial_number, "S C-X4U421302009");
    assert_eq!(info.module_type_name, "6ES7 315-2AG10-0AB0");
    assert_eq!(info.raw_entries.len(), 4);
    // the answer arrived in more than one data unit
    assert!(plc.counters.continuations.load(Ordering::SeqCst) >= 1);

    client.disconnect().await;
}

#[tokio::test]
async fn available_ssl_ids_are_listed() {
    let plc = MockPlc::new();
    let entries = vec![vec![0x00, 0x11], vec![0x00, 0x1C], vec![0x04, 0x24]];
    plc.with(|state| {
        state.ssl.insert(0x0000, ssl_payload(0x0000, 2, &entries));
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let ids = client.get_available_ssl().await.unwrap();
    assert_eq!(ids, vec![0x0011, 0x001C, 0x0424]);

    client.disconnect().await;
}

#[tokio::test]
async fn module_identification_is_parsed() {
    let plc = MockPlc::new();
    let mut entry = 1u16.to_be_bytes().to_vec();
    let mut order = [b' '; 20];
    order[..18].copy_from_slice(b"6ES7 315-2AG10-0AB");
    entry.extend_from_slice(&order);
    entry.extend_from_slice(&[0x00, 0xC0]); // module type
    entry.extend_from_slice(&[0x00, 0x01]); // hardware version
    entry.extend_from_slice(&[0x20, 0x06]); // firmware version
    plc.with(|state| {
        state.ssl.insert(0x0011, ssl_payload(0x0011, 28, &[entry]));
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let modules = client.get_module_identification().await.unwrap();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].index, 1);
    assert_eq!(modules[0].order_number, "6ES7 315-2AG10-0AB");
    assert_eq!(modules[0].firmware_version, 0x2006);

    client.disconnect().await;
}

#[tokio::test]
async fn cpu_state_is_read_from_the_status_list() {
    let plc = MockPlc::new();
    plc.with(|state| {
        let entry = vec![0x04, 0x24, 0x00, 0x08, 0, 0, 0, 0, 0, 0];
        state.ssl.insert(0x0424, ssl_payload(0x0424, 10, &[entry]));
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    assert_eq!(client.cpu_state().await.unwrap(), CpuState::Run);

    client.disconnect().await;
}

#[tokio::test]
async fn clock_round_trips() {
    let plc = MockPlc::new();
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let time = client.get_time().await.unwrap();
    assert_eq!(
        time,
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap()
    );

    let wanted = NaiveDate::from_ymd_opt(2026, 8, 1)
        .unwrap()
        .and_hms_milli_opt(12, 30, 45, 500)
        .unwrap();
    client.set_time(wanted).await.unwrap();
    assert_eq!(client.get_time().await.unwrap(), wanted);

    client.disconnect().await;
}

#[tokio::test]
async fn block_services_answer() {
    let plc = MockPlc::new();
    plc.with(|state| {
        state.block_counts = vec![(0x38, 2), (0x41, 11), (0x45, 3)];
        state.blocks_of_type = vec![(1, 0x22, 0x05), (888, 0x22, 0x05)];
        let mut info = vec![0u8; 78];
        info[8] = 0x05; // DB language
        info[9] = 0x0A; // DB
        info[10..12].copy_from_slice(&888u16.to_be_bytes());
        info[24..26].copy_from_slice(&366u16.to_be_bytes());
        info[30..32].copy_from_slice(&366u16.to_be_bytes());
        info[38..40].copy_from_slice(&256u16.to_be_bytes());
        state.block_info = info;
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let counts = client.block_count().await.unwrap();
    assert_eq!(counts[&BlockType::Ob], 2);
    assert_eq!(counts[&BlockType::Db], 11);
    assert_eq!(counts[&BlockType::Fb], 3);

    let blocks = client.list_blocks(BlockType::Db).await.unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[1].number, 888);
    assert_eq!(blocks[1].language, 0x05);

    let info = client.block_info(BlockType::Db, 888).await.unwrap();
    assert_eq!(info.block_number, 888);
    assert_eq!(info.mc7_size, 256);

    client.disconnect().await;
}

#[tokio::test]
async fn full_db_read_sizes_itself_from_block_info() {
    let plc = MockPlc::new();
    plc.with(|state| {
        let mut info = vec![0u8; 78];
        info[8] = 0x05;
        info[9] = 0x0A;
        info[10..12].copy_from_slice(&7u16.to_be_bytes());
        info[24..26].copy_from_slice(&1u16.to_be_bytes());
        info[30..32].copy_from_slice(&1u16.to_be_bytes());
        info[38..40].copy_from_slice(&64u16.to_be_bytes());
        state.block_info = info;
        let image = state.memory.entry((0x84, 7)).or_insert_with(|| vec![0u8; 2048]);
        for (i, byte) in image.iter_mut().enumerate().take(64) {
            *byte = i as u8;
        }
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let db = client.read_full_db(7).await.unwrap();
    assert_eq!(db.len(), 64);
    assert_eq!(db[63], 63);

    client.disconnect().await;
}
