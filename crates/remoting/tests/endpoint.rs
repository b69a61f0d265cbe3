//! Endpoint lifecycle and registrations

use assert_matches::assert_matches;
use remoting::{
    AuthenticationConfiguration, Endpoint, EndpointConfig, HandleableCloseable, RemotingError,
};
use remoting_testkit::{init_tracing, local_destination, ChannelCollector, CountingProviderFactory};
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn close_waits_for_every_connection() {
    init_tracing();
    let endpoint = Endpoint::builder().endpoint_name("closer").build().unwrap();
    let connection = endpoint
        .connect(&local_destination(), &AuthenticationConfiguration::anonymous(), None)
        .get()
        .await
        .unwrap();
    assert_eq!(connection.remote_endpoint_name().as_deref(), Some("closer"));
    // Provider, client half and server half.
    assert_eq!(endpoint.outstanding_resources(), 3);
    assert_eq!(endpoint.connections().len(), 2);

    tokio::time::timeout(WAIT, endpoint.close()).await.unwrap();
    assert!(!connection.is_open());
    assert_eq!(endpoint.outstanding_resources(), 0);
    assert!(endpoint.connections().is_empty());
}

#[tokio::test]
async fn closed_endpoint_refuses_work() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    endpoint.close().await;

    assert_matches!(
        endpoint
            .get_connected_identity(&local_destination(), None, &AuthenticationConfiguration::anonymous())
            .get()
            .await,
        Err(RemotingError::NotOpen { .. })
    );
    assert_matches!(
        endpoint
            .connect(&local_destination(), &AuthenticationConfiguration::anonymous(), None)
            .get()
            .await,
        Err(RemotingError::NotOpen { .. })
    );
    assert_matches!(endpoint.execute(async {}), Err(RemotingError::NotOpen { .. }));
    assert_matches!(
        endpoint.register_service("late", ChannelCollector::new(), None),
        Err(RemotingError::NotOpen { .. })
    );
}

#[tokio::test]
async fn executed_tasks_hold_the_endpoint_open() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    let (release, held) = oneshot::channel::<()>();
    endpoint
        .execute(async move {
            let _ = held.await;
        })
        .unwrap();
    assert_eq!(endpoint.outstanding_resources(), 2);

    let closing = {
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.close().await })
    };
    assert!(tokio::time::timeout(Duration::from_millis(50), endpoint.await_closed())
        .await
        .is_err());
    assert!(!endpoint.is_open());

    release.send(()).unwrap();
    tokio::time::timeout(WAIT, closing).await.unwrap().unwrap();
    assert_eq!(endpoint.outstanding_resources(), 0);
}

#[tokio::test]
async fn unknown_scheme_is_reported() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    assert_matches!(
        endpoint
            .connect(
                &Url::parse("nowhere://host:1").unwrap(),
                &AuthenticationConfiguration::anonymous(),
                None
            )
            .get()
            .await,
        Err(RemotingError::UnknownScheme { scheme }) if scheme == "nowhere"
    );
    assert_eq!(endpoint.outstanding_resources(), 1);
}

#[tokio::test]
async fn service_names_are_validated_and_unique() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    endpoint.register_service("jboss.ejb", ChannelCollector::new(), None).unwrap();
    assert_matches!(
        endpoint.register_service("jboss.ejb", ChannelCollector::new(), None),
        Err(RemotingError::DuplicateRegistration { .. })
    );
    assert_matches!(
        endpoint.register_service("bad name", ChannelCollector::new(), None),
        Err(RemotingError::InvalidServiceName { .. })
    );
    assert!(endpoint.service_listener("jboss.ejb").is_some());
}

#[tokio::test]
async fn provider_registration_can_be_withdrawn() {
    init_tracing();
    let endpoint = Endpoint::builder().build().unwrap();
    let counting = CountingProviderFactory::new();
    let registration = endpoint.add_connection_provider("Counted", &counting).unwrap();
    assert_eq!(registration.name(), "counted");
    assert_matches!(
        endpoint.add_connection_provider("counted", &counting),
        Err(RemotingError::DuplicateRegistration { .. })
    );
    assert_matches!(
        endpoint.add_connection_provider("9lives", &counting),
        Err(RemotingError::Configuration { .. })
    );

    let destination = Url::parse("counted://peer:1").unwrap();
    endpoint
        .connect(&destination, &AuthenticationConfiguration::anonymous(), None)
        .get()
        .await
        .unwrap();
    assert_eq!(counting.connects(), 1);

    registration.close().await;
    assert_matches!(
        endpoint
            .connect(&destination, &AuthenticationConfiguration::anonymous(), None)
            .get()
            .await,
        Err(RemotingError::UnknownScheme { .. })
    );
}

#[test]
fn owned_pool_shuts_down_with_the_endpoint() {
    let endpoint = Endpoint::builder()
        .config(EndpointConfig {
            worker_threads: 2,
            ..EndpointConfig::default()
        })
        .build()
        .unwrap();
    let handle = endpoint.executor().clone();
    handle.block_on(async {
        let connection = endpoint
            .connect(&local_destination(), &AuthenticationConfiguration::anonymous(), None)
            .get()
            .await
            .unwrap();
        endpoint.close().await;
        assert!(!connection.is_open());
    });
    assert!(!endpoint.is_open());
}
