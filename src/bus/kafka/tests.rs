use super::*;
use crate::test_utils::make_event;

#[test]
fn test_message_key_is_aggregate_id() {
    let event = make_event("Created", 1);
    assert_eq!(message_key(&event), event.aggregate_id().to_string());
}

#[test]
fn test_offset_reset_mapping() {
    assert_eq!(offset_reset(StartOffset::Earliest), "earliest");
    assert_eq!(offset_reset(StartOffset::Latest), "latest");
    assert_eq!(offset_reset(StartOffset::Offset(10)), "earliest");
}

#[test]
fn test_skip_offset_below_explicit_start() {
    assert!(skip_offset(StartOffset::Offset(5), 4));
    assert!(!skip_offset(StartOffset::Offset(5), 5));
    assert!(!skip_offset(StartOffset::Earliest, 0));
    assert!(!skip_offset(StartOffset::Latest, 0));
}

#[test]
fn test_consumer_config() {
    let config = BusConfig::new("localhost:9092")
        .with_app_id("billing")
        .with_start_offset(StartOffset::Latest);
    let client = consumer_config(&config, &config.group_id("projector"));

    assert_eq!(client.get("bootstrap.servers"), Some("localhost:9092"));
    assert_eq!(client.get("group.id"), Some("billing_projector"));
    assert_eq!(client.get("enable.auto.commit"), Some("false"));
    assert_eq!(client.get("auto.offset.reset"), Some("latest"));
}

#[test]
fn test_producer_config() {
    let client = producer_config(&BusConfig::new("broker:9092"));
    assert_eq!(client.get("bootstrap.servers"), Some("broker:9092"));
    assert_eq!(client.get("acks"), Some("all"));
    assert_eq!(client.get("enable.idempotence"), Some("true"));
}

#[tokio::test]
async fn test_invalid_partitions_fail_before_connecting() {
    for partitions in [0, -1, -42] {
        // Nothing listens on this address; validation must fail first.
        let config = BusConfig::new("127.0.0.1:1").with_partitions(partitions);
        let result = KafkaEventBus::new(config).await;
        assert!(matches!(result, Err(BusError::InvalidPartitions(p)) if p == partitions));
    }
}

#[tokio::test]
async fn test_empty_address_rejected() {
    let result = KafkaEventBus::new(BusConfig::default()).await;
    assert!(matches!(result, Err(BusError::Config(_))));
}
