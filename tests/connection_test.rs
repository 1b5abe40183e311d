mod common;

use common::MockPlc;
use s7comm::{Client, Error, Event, Options};
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

#[tokio::test]
async fn window_limits_jobs_in_flight() {
    let plc = MockPlc::new();
    plc.with(|state| state.response_delay = Duration::from_millis(20));
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let mut reads = Vec::new();
    for i in 0..20u32 {
        let client = client.clone();
        reads.push(tokio::spawn(async move { client.db_read(1, i, 1).await }));
    }
    for read in reads {
        read.await.unwrap().unwrap();
    }

    // 8 was negotiated, so at most 8 jobs were ever unanswered
    let peak = plc.counters.peak_outstanding.load(Ordering::SeqCst);
    assert_eq!(peak, 8, "peak outstanding was {}", peak);
    assert_eq!(plc.counters.read_jobs.load(Ordering::SeqCst), 20);

    client.disconnect().await;
}

#[tokio::test]
async fn job_timeout_poisons_the_connection() {
    let plc = MockPlc::new();
    plc.with(|state| state.ignore_reads = true);
    let client = {
        let mut options = Options::new("mock");
        options.custom_transport = Some(plc.factory());
        options.auto_reconnect = Duration::ZERO;
        options.timeout = Duration::from_millis(100);
        Client::new(options)
    };
    client.connect().await.unwrap();
    let mut events = client.subscribe();

    let error = client.db_read(1, 0, 1).await.unwrap_err();
    assert!(matches!(error, Error::Timeout), "got {:?}", error);

    // one stuck job tears the whole connection down
    assert!(matches!(next_event(&mut events).await, Event::Disconnect));
    let error = client.db_read(1, 0, 1).await.unwrap_err();
    assert!(matches!(error, Error::NotConnected), "got {:?}", error);
}

#[tokio::test]
async fn upload_concatenates_chunks() {
    let plc = MockPlc::new();
    plc.with(|state| state.upload_chunks = vec![vec![0xAA, 0xBB], vec![0xCC]]);
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let image = {
        use tokio_test::assert_ok;
        assert_ok!(client.upload_block("_0A00001A").await)
    };
    assert_eq!(image, vec![0xAA, 0xBB, 0xCC]);
    assert_eq!(plc.counters.end_uploads.load(Ordering::SeqCst), 1);
    assert_eq!(plc.counters.aborted_uploads.load(Ordering::SeqCst), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn failed_upload_is_aborted() {
    let plc = MockPlc::new();
    plc.with(|state| {
        state.upload_chunks = vec![vec![0xAA, 0xBB], vec![0xCC]];
        state.upload_fail_at = Some(1);
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let error = client.upload_block("_0A00001A").await.unwrap_err();
    assert!(matches!(error, Error::PlcError { .. }), "got {:?}", error);
    assert_eq!(plc.counters.aborted_uploads.load(Ordering::SeqCst), 1);

    client.disconnect().await;
}

#[tokio::test]
async fn upload_by_block_number_builds_the_filename() {
    let plc = MockPlc::new();
    plc.with(|state| state.upload_chunks = vec![vec![0x70, 0x70]]);
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let image = client.upload(s7comm::BlockType::Db, 1).await.unwrap();
    assert_eq!(image, vec![0x70, 0x70]);

    client.disconnect().await;
}

#[tokio::test]
async fn header_error_pair_fails_the_job() {
    let plc = MockPlc::new();
    plc.with(|state| {
        state.upload_chunks = vec![vec![1]];
        state.upload_fail_at = Some(0);
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let error = client.upload_block("_0A00001A").await.unwrap_err();
    match error {
        Error::PlcError { class, code } => {
            assert_eq!(class, 0x81);
            assert_eq!(code, 0x04);
        }
        other => panic!("expected a PLC error, got {:?}", other),
    }

    client.disconnect().await;
}

#[tokio::test]
async fn reads_and_writes_slice_to_the_pdu_limit() {
    let plc = MockPlc::new();
    plc.with(|state| state.pdu_size = 240);
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let pattern: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    client.mb_write(0, &pattern).await.unwrap();
    // 240 - 28 bytes of payload per write slice
    assert_eq!(plc.counters.write_jobs.load(Ordering::SeqCst), 3);

    let read = client.mb_read(0, 500).await.unwrap();
    assert_eq!(read, pattern);
    // 240 - 18 bytes of payload per read slice
    assert_eq!(plc.counters.read_jobs.load(Ordering::SeqCst), 3);

    client.disconnect().await;
}
