use satlink::protocol::{MAX_FRAME_SIZE, MAX_PACKET_PAYLOAD};
use satlink::service::{PING_REPLY, PING_REQUEST};
use satlink::*;
use std::time::Duration;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_millis(200);
const SHORT: Duration = Duration::from_millis(20);
const PUBLISHER_NODE: NodeAddress = NodeAddress(1);

fn key(value: u8) -> MuxKey {
    MuxKey::new(value).unwrap()
}

#[tokio::test]
async fn test_round_trip_every_payload_size() {
    let config = LinkConfig::default();
    let network = MemoryNetwork::from_config(&config);
    let mut publisher = Publisher::bind(&network.node(PUBLISHER_NODE), key(5), config.clone())
        .await
        .unwrap();
    let mut subscriber = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, key(5), 0, &config)
        .await
        .unwrap();
    publisher.accept(WAIT).await.unwrap().unwrap();
    publisher.poll_requests(SHORT).await;

    for size in 0..=MAX_PACKET_PAYLOAD {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7 + size) as u8).collect();
        let sent = TelemetryPacket::new(0x0001, &payload).unwrap();
        let report = publisher.publish(sent.clone()).await.unwrap();
        assert_eq!(report.delivered, 1, "size {size}");

        let received = subscriber.read(WAIT).await.unwrap().unwrap();
        assert_eq!(received.payload(), payload.as_slice(), "size {size}");
        assert_eq!(received, sent);
    }

    let too_big = vec![0u8; MAX_PACKET_PAYLOAD + 1];
    assert_eq!(
        TelemetryPacket::new(0x0001, &too_big),
        Err(LinkError::PayloadTooLarge { size: MAX_PACKET_PAYLOAD + 1, max: MAX_PACKET_PAYLOAD })
    );
    assert_eq!(MAX_PACKET_PAYLOAD + 4, MAX_FRAME_SIZE);
}

#[tokio::test]
async fn test_housekeeping_traffic_is_diverted() {
    let config = LinkConfig::default();
    let network = MemoryNetwork::from_config(&config);
    let mut endpoint = Endpoint::bind(&network.node(PUBLISHER_NODE), key(5), 2).await.unwrap();
    let mut subscriber = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, key(5), 0x01, &config)
        .await
        .unwrap();
    let mut server = endpoint.accept(WAIT).await.unwrap().unwrap();

    let request = server.receive_keyed(config.control_key, WAIT).await.unwrap().unwrap();
    assert_eq!(TelemetryRequest::from_frame(&request).unwrap(), TelemetryRequest::subscribe(0x01));

    server
        .send_frame(Frame::new(MuxKey::PING, &[PING_REQUEST, 0, 7]).unwrap(), WAIT)
        .await
        .unwrap();
    let data = TelemetryPacket::new(0x01, b"data").unwrap();
    server.send_frame(data.to_frame(key(5)).unwrap(), WAIT).await.unwrap();

    // The ping is answered behind the caller's back and reads as nothing.
    assert_eq!(subscriber.read(WAIT).await, Ok(None));
    assert_eq!(subscriber.read(WAIT).await, Ok(Some(data)));
    assert_eq!(subscriber.connection().stats().frames_diverted, 1);

    let reply = server.receive(WAIT).await.unwrap().unwrap();
    assert_eq!(reply.key(), MuxKey::PING);
    assert_eq!(reply.body(), &[PING_REPLY, 0, 7]);
}

#[tokio::test]
async fn test_read_timeout_is_not_an_error() {
    let config = LinkConfig::default();
    let network = MemoryNetwork::from_config(&config);
    let _publisher = Publisher::bind(&network.node(PUBLISHER_NODE), key(5), config.clone())
        .await
        .unwrap();
    let mut subscriber = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, key(5), 0, &config)
        .await
        .unwrap();

    let timeout = Duration::from_millis(50);
    let started = Instant::now();
    assert_eq!(subscriber.read(timeout).await, Ok(None));
    assert!(started.elapsed() >= timeout);
}

#[tokio::test]
async fn test_subscribe_without_publisher_is_no_route() {
    let config = LinkConfig::default();
    let network = MemoryNetwork::from_config(&config);
    let result = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, key(5), 0, &config).await;
    assert!(matches!(result, Err(LinkError::NoRoute)));

    let result = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, MuxKey::CONTROL, 0, &config).await;
    assert!(matches!(result, Err(LinkError::InvalidKey(31))));

    let result = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, MuxKey::BUF_FREE, 0, &config).await;
    assert!(matches!(result, Err(LinkError::InvalidKey(29))));
}

#[tokio::test]
async fn test_publisher_shutdown_is_link_closed() {
    let config = LinkConfig::default();
    let network = MemoryNetwork::from_config(&config);
    let mut publisher = Publisher::bind(&network.node(PUBLISHER_NODE), key(5), config.clone())
        .await
        .unwrap();
    let mut subscriber = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, key(5), 0, &config)
        .await
        .unwrap();
    publisher.accept(WAIT).await.unwrap().unwrap();
    publisher.shutdown();

    let err = subscriber.read(WAIT).await.unwrap_err();
    assert_eq!(err, LinkError::LinkClosed);
    assert!(subscriber.is_closed());
}

#[tokio::test]
async fn test_local_mask_tracking() {
    let config = LinkConfig::default();
    let network = MemoryNetwork::from_config(&config);
    let _publisher = Publisher::bind(&network.node(PUBLISHER_NODE), key(5), config.clone())
        .await
        .unwrap();
    let mut subscriber = Subscriber::subscribe(&network.node(NodeAddress(2)), PUBLISHER_NODE, key(5), 0x01, &config)
        .await
        .unwrap();

    assert_eq!(subscriber.key(), key(5));
    assert_eq!(subscriber.publisher(), PUBLISHER_NODE);
    assert_eq!(subscriber.mask(), Some(0x01));

    subscriber.add_topics(0x04).await.unwrap();
    assert_eq!(subscriber.mask(), Some(0x05));
    subscriber.unsubscribe(0x05).await.unwrap();
    assert_eq!(subscriber.mask(), None);
    subscriber.add_topics(ALL_TOPICS).await.unwrap();
    assert_eq!(subscriber.mask(), Some(ALL_TOPICS));
}
