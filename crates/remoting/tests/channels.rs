//! Channels opened over local connections

use assert_matches::assert_matches;
use remoting::{
    AuthenticationConfiguration, Channel, ConnectionPeerIdentity, Endpoint, EndpointConfig,
    HandleableCloseable, Principal, RemotingError, SimpleSecurityDomain,
};
use remoting_testkit::{init_tracing, local_destination, ChannelCollector, EchoService};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn anonymous_identity(endpoint: &Endpoint) -> ConnectionPeerIdentity {
    endpoint
        .get_connected_identity(&local_destination(), None, &AuthenticationConfiguration::anonymous())
        .get()
        .await
        .unwrap()
}

async fn send(channel: &Arc<dyn Channel>, body: &[u8]) {
    let mut message = channel.write_message().await.unwrap();
    message.write_all(body).await.unwrap();
    message.close().await.unwrap();
}

async fn receive(channel: &Arc<dyn Channel>) -> Vec<u8> {
    let mut message = channel.next_message().await.unwrap().unwrap();
    let mut body = Vec::new();
    message.read_to_end(&mut body).await.unwrap();
    body
}

#[tokio::test]
async fn echo_round_trip() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    endpoint.register_service("echo", EchoService::new(), None).unwrap();
    let identity = anonymous_identity(&endpoint).await;

    let channel = identity.open_channel("echo", None).get().await.unwrap();
    send(&channel, b"hello").await;
    assert_eq!(receive(&channel).await, b"hello");
    send(&channel, b"again").await;
    assert_eq!(receive(&channel).await, b"again");
}

#[tokio::test]
async fn unknown_service_fails_the_open() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    let identity = anonymous_identity(&endpoint).await;
    assert_matches!(
        identity.open_channel("missing", None).get().await,
        Err(RemotingError::ServiceNotFound { service }) if service == "missing"
    );
}

#[tokio::test]
async fn accepted_channel_reports_the_opening_identity() {
    init_tracing();
    let endpoint = Endpoint::builder()
        .security_domain(SimpleSecurityDomain::new().with_user("bob", "pw"))
        .build()
        .unwrap();
    let collector = ChannelCollector::new();
    endpoint.register_service("collect", collector.clone(), None).unwrap();

    let anonymous = anonymous_identity(&endpoint).await;
    anonymous.open_channel("collect", None).get().await.unwrap();
    assert_eq!(collector.next().await.peer_principal(), Some(Principal::Anonymous));

    let bob = endpoint
        .get_connected_identity(
            &local_destination(),
            None,
            &AuthenticationConfiguration::for_user("bob").with_password("pw"),
        )
        .get()
        .await
        .unwrap();
    let ours = bob.open_channel("collect", None).get().await.unwrap();
    let theirs = collector.next().await;
    assert_eq!(theirs.peer_principal(), Some(Principal::Named("bob".into())));
    assert_eq!(ours.peer_principal(), None);
}

#[tokio::test]
async fn full_queue_blocks_the_next_writer() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    let collector = ChannelCollector::new();
    endpoint.register_service("sink", collector.clone(), None).unwrap();
    let identity = anonymous_identity(&endpoint).await;

    let channel = identity.open_channel("sink", None).get().await.unwrap();
    assert_eq!(channel.options().local_queue_capacity, 8);
    let accepted = collector.next().await;
    for n in 0..8u8 {
        send(&channel, &[n]).await;
    }

    let ninth = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            let mut message = channel.write_message().await?;
            message.write_all(b"ninth").await?;
            message.close().await?;
            Ok::<_, std::io::Error>(())
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ninth.is_finished());

    assert_eq!(receive(&accepted).await, [0]);
    tokio::time::timeout(Duration::from_secs(5), ninth)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn outbound_channel_limit_is_enforced() {
    init_tracing();
    let mut config = EndpointConfig::default();
    config.connection.max_outbound_channels = 2;
    let endpoint = Endpoint::builder().config(config).build().unwrap();
    let collector = ChannelCollector::new();
    endpoint.register_service("sink", collector, None).unwrap();
    let identity = anonymous_identity(&endpoint).await;

    let first = identity.open_channel("sink", None).get().await.unwrap();
    let _second = identity.open_channel("sink", None).get().await.unwrap();
    assert_matches!(
        identity.open_channel("sink", None).get().await,
        Err(RemotingError::Protocol { message }) if message.contains("too many channels")
    );

    first.close().await;
    identity.open_channel("sink", None).get().await.unwrap();
}

#[tokio::test]
async fn closed_registration_stops_accepting() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    let collector = ChannelCollector::new();
    let registration = endpoint.register_service("sink", collector.clone(), None).unwrap();
    let identity = anonymous_identity(&endpoint).await;

    registration.close().await;
    assert!(collector.terminated());
    assert_matches!(
        identity.open_channel("sink", None).get().await,
        Err(RemotingError::ServiceNotFound { .. })
    );
    // The name is free again.
    endpoint.register_service("sink", ChannelCollector::new(), None).unwrap();
}

#[tokio::test]
async fn closing_the_connection_closes_its_channels() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    let collector = ChannelCollector::new();
    endpoint.register_service("sink", collector.clone(), None).unwrap();
    let identity = anonymous_identity(&endpoint).await;

    let channel = identity.open_channel("sink", None).get().await.unwrap();
    let accepted = collector.next().await;
    identity.connection().unwrap().close().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        channel.await_closed().await;
        accepted.await_closed().await;
    })
    .await
    .unwrap();
    assert_matches!(
        identity.open_channel("sink", None).get().await,
        Err(RemotingError::NotOpen { .. })
    );
}
