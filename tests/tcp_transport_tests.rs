use satlink::*;
use std::time::Duration;

const WAIT: Duration = Duration::from_millis(1000);
const SHORT: Duration = Duration::from_millis(50);

// Each test gets its own port range so they can run in parallel.
fn config(base_port: u16) -> LinkConfig {
    LinkConfig {
        tcp_base_port: base_port,
        ..LinkConfig::default()
    }
}

fn key(value: u8) -> MuxKey {
    MuxKey::new(value).unwrap()
}

#[tokio::test]
async fn test_publish_subscribe_over_tcp() {
    let config = config(47200);
    let server = TcpTransport::new(NodeAddress(1), config.clone());
    let client = TcpTransport::new(NodeAddress(2), config.clone());

    let mut publisher = Publisher::bind(&server, key(5), config.clone()).await.unwrap();
    let mut subscriber = Subscriber::subscribe(&client, NodeAddress(1), key(5), 0x01, &config)
        .await
        .unwrap();

    publisher.accept(WAIT).await.unwrap().unwrap();
    assert_eq!(publisher.poll_requests(WAIT).await, 1);

    let power = TelemetryPacket::new(0x01, b"{\"voltage\":28.1}").unwrap();
    let thermal = TelemetryPacket::new(0x02, b"{\"temp\":21.5}").unwrap();
    assert_eq!(publisher.publish(thermal).await.unwrap().filtered, 1);
    assert_eq!(publisher.publish(power.clone()).await.unwrap().delivered, 1);

    assert_eq!(subscriber.read(WAIT).await, Ok(Some(power)));
    assert_eq!(subscriber.read(SHORT).await, Ok(None));
}

#[tokio::test]
async fn test_bind_twice_is_address_in_use() {
    let config = config(47250);
    let transport = TcpTransport::new(NodeAddress(1), config);

    let _endpoint = Endpoint::bind(&transport, key(3), 2).await.unwrap();
    assert!(matches!(
        Endpoint::bind(&transport, key(3), 2).await,
        Err(LinkError::AddressInUse(3))
    ));
}

#[tokio::test]
async fn test_refused_connect_is_no_route() {
    let config = config(47300);
    let transport = TcpTransport::new(NodeAddress(2), config);

    let result = Connection::connect(&transport, NodeAddress(1), key(4), WAIT).await;
    assert!(matches!(result, Err(LinkError::NoRoute)));
}

#[tokio::test]
async fn test_peer_close_is_link_closed() {
    let config = config(47350);
    let server = TcpTransport::new(NodeAddress(1), config.clone());
    let client = TcpTransport::new(NodeAddress(2), config);

    let mut endpoint = Endpoint::bind(&server, key(6), 1).await.unwrap();
    let mut connection = Connection::connect(&client, NodeAddress(1), key(6), WAIT).await.unwrap();
    let mut accepted = endpoint.accept(WAIT).await.unwrap().unwrap();

    accepted.send(b"last words", WAIT).await.unwrap();
    accepted.close();

    // Frames already on the wire are still delivered before the close.
    assert_eq!(connection.receive(WAIT).await.unwrap().unwrap().body(), b"last words");
    assert_eq!(connection.receive(WAIT).await, Err(LinkError::LinkClosed));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_ping_over_tcp() {
    let config = config(47400);
    let server = TcpTransport::new(NodeAddress(1), config.clone());
    let client = TcpTransport::new(NodeAddress(2), config);

    let mut endpoint = Endpoint::bind(&server, key(8), 1).await.unwrap();
    let mut connection = Connection::connect(&client, NodeAddress(1), key(8), WAIT).await.unwrap();
    let mut accepted = endpoint.accept(WAIT).await.unwrap().unwrap();

    let responder = tokio::spawn(async move {
        let frame = accepted.receive_keyed(key(8), WAIT).await.unwrap();
        (accepted, frame)
    });

    assert!(connection.ping(WAIT).await.unwrap().is_some());
    let (accepted, frame) = responder.await.unwrap();
    assert!(frame.is_none());
    assert_eq!(accepted.stats().frames_diverted, 1);
}

#[tokio::test]
async fn test_base_port_overflow_is_rejected() {
    // Built directly, so validation never ran.
    let config = config(65530);
    let transport = TcpTransport::new(NodeAddress(1), config);

    assert!(matches!(
        Endpoint::bind(&transport, key(10), 1).await,
        Err(LinkError::InvalidKey(10))
    ));
    assert!(matches!(
        Connection::connect(&transport, NodeAddress(2), key(10), WAIT).await,
        Err(LinkError::InvalidKey(10))
    ));
}
