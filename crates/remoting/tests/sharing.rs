//! Connection sharing across callers and credentials

use futures::future::join_all;
use remoting::connection_info::Sharing;
use remoting::{AuthenticationConfiguration, Endpoint, HandleableCloseable, SimpleSecurityDomain, Status};
use remoting_testkit::{init_tracing, sharing_config, CountingProviderFactory};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn counted_endpoint(remote_auth: bool, counting: &CountingProviderFactory) -> (Arc<Endpoint>, Url) {
    let endpoint = Endpoint::builder()
        .config(sharing_config(remote_auth))
        .security_domain(SimpleSecurityDomain::new().with_user("bob", "pw"))
        .add_provider("counted", counting.clone())
        .build()
        .unwrap();
    (endpoint, Url::parse("counted://peer:4447").unwrap())
}

fn bob() -> AuthenticationConfiguration {
    AuthenticationConfiguration::for_user("bob").with_password("pw")
}

async fn wait_for_sharing(endpoint: &Endpoint, destination: &Url, expected: Sharing) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while endpoint.sharing(destination, None) != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_connect() {
    init_tracing();
    let counting = CountingProviderFactory::gated();
    let (endpoint, destination) = counted_endpoint(true, &counting);
    let anonymous = AuthenticationConfiguration::anonymous();

    let requests = (0..16).map(|_| {
        let endpoint = Arc::clone(&endpoint);
        let destination = destination.clone();
        let config = anonymous.clone();
        tokio::spawn(async move { endpoint.get_connected_identity(&destination, None, &config) })
    });
    let futures: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(
        endpoint.sharing(&destination, None),
        Sharing::MaybeShared
    );

    counting.release();
    let identities: Vec<_> = join_all(futures.iter().map(|future| future.get()))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(counting.connects(), 1);
    let first = identities[0].connection().unwrap();
    for identity in &identities {
        assert_eq!(identity.id(), 0);
        assert!(Arc::ptr_eq(&identity.connection().unwrap(), &first));
    }
}

#[tokio::test]
async fn shared_connection_hosts_every_credential() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(true, &counting);

    let anonymous = endpoint
        .get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous())
        .get()
        .await
        .unwrap();
    let named = endpoint
        .get_connected_identity(&destination, None, &bob())
        .get()
        .await
        .unwrap();

    assert_eq!(counting.connects(), 1);
    assert!(named.id() >= 2);
    assert_eq!(named.principal().name(), "bob");
    assert!(Arc::ptr_eq(
        &anonymous.connection().unwrap(),
        &named.connection().unwrap()
    ));
    assert_eq!(
        endpoint.sharing(&destination, None),
        Sharing::Shared
    );
}

#[tokio::test]
async fn unshared_connections_are_per_credential() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(false, &counting);

    let anonymous = endpoint
        .get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous())
        .get()
        .await
        .unwrap();
    let named = endpoint
        .get_connected_identity(&destination, None, &bob())
        .get()
        .await
        .unwrap();
    let again = endpoint
        .get_connected_identity(&destination, None, &bob())
        .get()
        .await
        .unwrap();

    assert_eq!(counting.connects(), 2);
    assert_eq!(named.id(), 0);
    assert_eq!(named, again);
    assert!(!Arc::ptr_eq(
        &anonymous.connection().unwrap(),
        &named.connection().unwrap()
    ));
    assert_eq!(
        endpoint.sharing(&destination, None),
        Sharing::NotShared
    );
}

#[tokio::test]
async fn waiting_credentials_connect_separately_once_unshared() {
    init_tracing();
    let counting = CountingProviderFactory::gated();
    let (endpoint, destination) = counted_endpoint(false, &counting);

    let first = endpoint.get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous());
    let second = endpoint.get_connected_identity(&destination, None, &bob());
    assert_eq!(counting.connects(), 1);

    counting.release();
    let first = first.get().await.unwrap();
    let second = second.get().await.unwrap();
    assert_eq!(counting.connects(), 2);
    assert_eq!(second.principal().name(), "bob");
    assert!(!Arc::ptr_eq(
        &first.connection().unwrap(),
        &second.connection().unwrap()
    ));
}

#[tokio::test]
async fn peeking_never_connects() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(true, &counting);
    let anonymous = AuthenticationConfiguration::anonymous();

    assert!(endpoint
        .get_connected_identity_if_connected(&destination, None, &anonymous)
        .is_none());
    assert_eq!(counting.connects(), 0);

    let identity = endpoint
        .get_connected_identity(&destination, None, &anonymous)
        .get()
        .await
        .unwrap();
    let peeked = endpoint
        .get_connected_identity_if_connected(&destination, None, &anonymous)
        .unwrap()
        .get()
        .await
        .unwrap();
    assert_eq!(identity, peeked);
    assert_eq!(counting.connects(), 1);
}

#[tokio::test]
async fn closed_connection_is_forgotten() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(true, &counting);
    let anonymous = AuthenticationConfiguration::anonymous();

    let identity = endpoint
        .get_connected_identity(&destination, None, &anonymous)
        .get()
        .await
        .unwrap();
    let connection = identity.connection().unwrap();
    connection.close().await;
    wait_for_sharing(&endpoint, &destination, Sharing::None).await;

    let replacement = endpoint
        .get_connected_identity(&destination, None, &anonymous)
        .get()
        .await
        .unwrap();
    assert_eq!(counting.connects(), 2);
    assert!(!Arc::ptr_eq(&replacement.connection().unwrap(), &connection));
}

#[tokio::test]
async fn failed_first_attempt_can_be_retried() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(true, &counting);
    let wrong = AuthenticationConfiguration::for_user("bob").with_password("nope");

    assert!(endpoint
        .get_connected_identity(&destination, None, &wrong)
        .get()
        .await
        .is_err());
    assert_eq!(
        endpoint.sharing(&destination, None),
        Sharing::None
    );

    endpoint
        .get_connected_identity(&destination, None, &bob())
        .get()
        .await
        .unwrap();
    assert_eq!(counting.connects(), 2);
}

#[tokio::test]
async fn closed_shared_connection_is_replaced_at_once() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(true, &counting);
    let anonymous = AuthenticationConfiguration::anonymous();

    let first = endpoint
        .get_connected_identity(&destination, None, &anonymous)
        .get()
        .await
        .unwrap();
    let closed = first.connection().unwrap();
    closed.close().await;
    assert_eq!(endpoint.sharing(&destination, None), Sharing::None);

    let named = endpoint
        .get_connected_identity(&destination, None, &bob())
        .get()
        .await
        .unwrap();
    assert_eq!(named.principal().name(), "bob");
    let replacement = named.connection().unwrap();
    assert!(replacement.is_open());
    assert!(!Arc::ptr_eq(&replacement, &closed));

    let again = endpoint
        .get_connected_identity(&destination, None, &anonymous)
        .get()
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&again.connection().unwrap(), &replacement));
    assert_eq!(counting.connects(), 2);
}

#[tokio::test]
async fn closed_unshared_connection_is_replaced_at_once() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(false, &counting);

    let anonymous = endpoint
        .get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous())
        .get()
        .await
        .unwrap();
    let named = endpoint
        .get_connected_identity(&destination, None, &bob())
        .get()
        .await
        .unwrap();
    let closed = named.connection().unwrap();
    closed.close().await;
    assert_eq!(endpoint.sharing(&destination, None), Sharing::NotShared);

    let reopened = endpoint
        .get_connected_identity(&destination, None, &bob())
        .get()
        .await
        .unwrap();
    assert!(reopened.connection().unwrap().is_open());
    assert!(!Arc::ptr_eq(&reopened.connection().unwrap(), &closed));
    assert!(anonymous.connection().unwrap().is_open());
    assert_eq!(counting.connects(), 3);
}

#[tokio::test]
async fn cancelled_identity_request_never_negotiates() {
    init_tracing();
    let counting = CountingProviderFactory::gated();
    let (endpoint, destination) = counted_endpoint(true, &counting);

    let anonymous = endpoint.get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous());
    let named = endpoint.get_connected_identity(&destination, None, &bob());
    named.cancel();
    assert_eq!(named.status(), Status::Cancelled);

    counting.release();
    let identity = anonymous.get().await.unwrap();
    let connection = identity.connection().unwrap();
    assert_eq!(connection.peer_identity_context().cached_identities(), 0);
    assert_eq!(connection.peer_identity_context().active_authentications(), 0);
    assert_eq!(counting.cancels(), 0);
    assert_eq!(named.status(), Status::Cancelled);
}

#[tokio::test]
async fn cancelling_the_only_request_cancels_the_connect() {
    init_tracing();
    let counting = CountingProviderFactory::gated();
    let (endpoint, destination) = counted_endpoint(true, &counting);
    let idle = endpoint.outstanding_resources();

    let pending = endpoint.get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous());
    assert_eq!(endpoint.sharing(&destination, None), Sharing::MaybeShared);
    assert_eq!(endpoint.outstanding_resources(), idle + 1);

    pending.cancel();
    assert_eq!(pending.status(), Status::Cancelled);
    assert_eq!(counting.cancels(), 1);
    assert_eq!(endpoint.sharing(&destination, None), Sharing::None);
    assert_eq!(endpoint.outstanding_resources(), idle);
    assert_eq!(endpoint.cached_destinations(), 0);

    counting.release();
    endpoint
        .get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous())
        .get()
        .await
        .unwrap();
    assert_eq!(counting.connects(), 2);
}

#[tokio::test]
async fn connect_survives_while_any_caller_still_waits() {
    init_tracing();
    let counting = CountingProviderFactory::gated();
    let (endpoint, destination) = counted_endpoint(true, &counting);
    let anonymous = AuthenticationConfiguration::anonymous();

    let leaving = endpoint.get_connected_identity(&destination, None, &anonymous);
    let staying = endpoint.get_connected_identity(&destination, None, &anonymous);
    leaving.cancel();
    assert_eq!(counting.cancels(), 0);
    assert_eq!(endpoint.sharing(&destination, None), Sharing::MaybeShared);

    counting.release();
    staying.get().await.unwrap();
    assert_eq!(leaving.status(), Status::Cancelled);
    assert_eq!(counting.connects(), 1);
}

#[tokio::test]
async fn idle_destinations_are_dropped_from_the_cache() {
    init_tracing();
    let counting = CountingProviderFactory::new();
    let (endpoint, destination) = counted_endpoint(true, &counting);

    let identity = endpoint
        .get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous())
        .get()
        .await
        .unwrap();
    assert_eq!(endpoint.cached_destinations(), 1);
    identity.connection().unwrap().close().await;
    assert_eq!(endpoint.cached_destinations(), 0);

    let elsewhere = Url::parse("counted://other:4447").unwrap();
    assert!(endpoint
        .get_connected_identity(&elsewhere, None, &AuthenticationConfiguration::for_user("bob").with_password("nope"))
        .get()
        .await
        .is_err());
    assert_eq!(endpoint.cached_destinations(), 0);
}
