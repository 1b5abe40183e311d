mod common;

use common::MockPlc;
use s7comm::{Client, Error, ItemGroup, Options, Value};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn client_for(plc: &MockPlc) -> Client {
    let mut options = Options::new("mock");
    options.custom_transport = Some(plc.factory());
    options.auto_reconnect = Duration::ZERO;
    Client::new(options)
}

#[tokio::test]
async fn grouped_write_then_read_echoes_values() {
    let plc = MockPlc::new();
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let mut group = ItemGroup::new(&client);
    let tags = [
        "DB1,REAL0",
        "DB1,INT4",
        "DB1,WORD6.2",
        "M10.3",
        "T5",
        "C2",
        "DB1,S20.8",
    ];
    group.add_items(&tags).unwrap();

    let values = vec![
        Value::Real(53.5),
        Value::Int(-2),
        Value::Array(vec![Value::Word(7), Value::Word(65535)]),
        Value::Bool(true),
        Value::Timer(2.5),
        Value::Counter(42),
        Value::String("hello".to_string()),
    ];
    group.write_items(&tags, &values).await.unwrap();
    assert_eq!(plc.counters.write_jobs.load(Ordering::SeqCst), 1);

    let read = group.read_all().await.unwrap();
    assert_eq!(read.len(), tags.len());
    for (tag, value) in tags.iter().zip(&values) {
        assert_eq!(read[*tag], *value, "tag {}", tag);
    }
    // everything fits one optimized telegram
    assert_eq!(plc.counters.read_jobs.load(Ordering::SeqCst), 1);

    client.disconnect().await;
}

#[tokio::test]
async fn adjacent_items_share_one_request() {
    let plc = MockPlc::new();
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let mut group = ItemGroup::new(&client);
    group.add_items(&["DB1,BYTE0", "DB1,BYTE3"]).unwrap();
    group.read_all().await.unwrap();
    assert_eq!(plc.counters.read_jobs.load(Ordering::SeqCst), 1);

    client.disconnect().await;
}

#[tokio::test]
async fn oversized_item_reads_across_packets() {
    let plc = MockPlc::new();
    plc.with(|state| {
        state.pdu_size = 240;
        let image = state.memory.entry((0x83, 0)).or_insert_with(|| vec![0u8; 2048]);
        for (i, byte) in image.iter_mut().enumerate().take(500) {
            *byte = (i % 251) as u8;
        }
    });
    let client = client_for(&plc);
    client.connect().await.unwrap();
    assert_eq!(client.pdu_size(), 240);

    let mut group = ItemGroup::new(&client);
    group.add_items(&["MB0.500"]).unwrap();
    let values = group.read_all().await.unwrap();
    assert_eq!(plc.counters.read_jobs.load(Ordering::SeqCst), 3);

    match &values["MB0.500"] {
        Value::Array(bytes) => {
            assert_eq!(bytes.len(), 500);
            for (i, value) in bytes.iter().enumerate() {
                assert_eq!(*value, Value::Byte((i % 251) as u8));
            }
        }
        other => panic!("expected a byte array, got {:?}", other),
    }

    client.disconnect().await;
}

#[tokio::test]
async fn failing_item_aborts_the_batch() {
    let plc = MockPlc::new();
    plc.with(|state| state.fail_read_at = Some((0x84, 5, 10)));
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let mut group = ItemGroup::new(&client);
    group
        .add_items(&["DB1,BYTE0", "DB5,BYTE10", "DB9,BYTE0"])
        .unwrap();
    let error = group.read_all().await.unwrap_err();
    match &error {
        Error::ReturnCode { code, context } => {
            assert_eq!(*code, 0x05);
            assert!(context.contains("DB5"), "context was {}", context);
        }
        other => panic!("expected a return code error, got {:?}", other),
    }
    assert_eq!(error.return_code(), Some(0x05));

    client.disconnect().await;
}

#[tokio::test]
async fn oversized_write_item_fails_fast() {
    let plc = MockPlc::new();
    plc.with(|state| state.pdu_size = 240);
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let mut group = ItemGroup::new(&client);
    let error = group
        .write_items(&["DB1,S0.240"], &[Value::String("x".to_string())])
        .await
        .unwrap_err();
    assert!(matches!(error, Error::ItemTooBig { .. }), "got {:?}", error);
    assert_eq!(plc.counters.write_jobs.load(Ordering::SeqCst), 0);

    client.disconnect().await;
}

#[tokio::test]
async fn write_accepts_tags_outside_the_group() {
    let plc = MockPlc::new();
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let mut group = ItemGroup::new(&client);
    group
        .write_items(&["DB7,INT0"], &[Value::Int(1234)])
        .await
        .unwrap();

    group.add_items(&["DB7,INT0"]).unwrap();
    let values = group.read_all().await.unwrap();
    assert_eq!(values["DB7,INT0"], Value::Int(1234));

    client.disconnect().await;
}

#[tokio::test]
async fn translation_callback_rewrites_tags() {
    let plc = MockPlc::new();
    let client = client_for(&plc);
    client.connect().await.unwrap();

    let mut group = ItemGroup::new(&client);
    group.set_translation_callback(Box::new(|tag| match tag {
        "motor_speed" => "DB2,INT0".to_string(),
        other => other.to_string(),
    }));
    group
        .write_items(&["motor_speed"], &[Value::Int(1500)])
        .await
        .unwrap();
    group.add_items(&["motor_speed"]).unwrap();
    let values = group.read_all().await.unwrap();
    assert_eq!(values["motor_speed"], Value::Int(1500));

    client.disconnect().await;
}

#[tokio::test]
async fn unparseable_tag_is_rejected() {
    let plc = MockPlc::new();
    let client = client_for(&plc);
    let mut group = ItemGroup::new(&client);
    let error = group.add_items(&["DB1,FLOAT0"]).unwrap_err();
    assert!(matches!(error, Error::ParseAddr { .. }));
}
