//! Identity negotiation, initiator and responder sides

use assert_matches::assert_matches;
use futures::future::join_all;
use remoting::{
    AuthFailureKind, AuthenticationConfiguration, Connection, Endpoint, EndpointConfig,
    HandleableCloseable, Principal, RemotingError, SimpleSecurityDomain, Status,
};
use remoting_testkit::{
    init_tracing, local_destination, Frame, Recorder, RecordingProviderFactory, Script,
    ScriptedClientFactory, ScriptedDomain,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const QUIET: Duration = Duration::from_millis(50);

fn user(name: &str) -> AuthenticationConfiguration {
    AuthenticationConfiguration::for_user(name).allow_mechanisms(["A", "B", "C"])
}

/// Connection whose handler records frames instead of sending them
async fn recorded(
    domain: ScriptedDomain,
    offered: &[&str],
    config: EndpointConfig,
) -> (Arc<Endpoint>, Arc<Connection>, Arc<Recorder>) {
    let recording = RecordingProviderFactory::new(offered.iter().copied());
    let endpoint = Endpoint::builder()
        .config(config)
        .security_domain(domain)
        .sasl_client_factory(ScriptedClientFactory::new(["A", "B", "C"]))
        .add_provider("rec", recording.clone())
        .build()
        .unwrap();
    let connection = endpoint
        .connect(
            &Url::parse("rec://peer").unwrap(),
            &AuthenticationConfiguration::anonymous(),
            None,
        )
        .get()
        .await
        .unwrap();
    (endpoint, connection, recording.recorder())
}

fn scripted() -> ScriptedDomain {
    ScriptedDomain::new(SimpleSecurityDomain::new())
        .with_mechanism("A", Script::Accept)
        .with_mechanism("C", Script::ChallengeThenAccept)
}

async fn expect_request(recorder: &Recorder, mechanism: &str) -> u32 {
    match recorder.next_frame().await {
        Frame::Request {
            id,
            mechanism: sent,
            ..
        } => {
            assert_eq!(sent, mechanism);
            id
        }
        other => panic!("expected an auth request, got {other:?}"),
    }
}

// Responder

#[tokio::test]
async fn unknown_mechanism_gets_an_inert_placeholder() {
    init_tracing();
    let domain = scripted();
    let stats = domain.stats();
    let (_endpoint, connection, recorder) = recorded(domain, &["A"], EndpointConfig::default()).await;

    connection.receive_auth_request(7, "NOPE", None);
    assert_eq!(recorder.next_frame().await, Frame::Reject { id: 7 });
    assert_eq!(stats.created(), 0);

    connection.receive_auth_response(7, b"let me in");
    assert_eq!(recorder.next_frame().await, Frame::Reject { id: 7 });
    assert_eq!(connection.live_server_auths(), 1);
    assert_eq!(connection.authorized_principal(7), None);
}

#[tokio::test]
async fn responder_authorizes_and_forgets_on_delete() {
    init_tracing();
    let domain = scripted();
    let stats = domain.stats();
    let (_endpoint, connection, recorder) = recorded(domain, &["A"], EndpointConfig::default()).await;

    connection.receive_auth_request(9, "A", Some(b"carol"));
    assert_eq!(
        recorder.next_frame().await,
        Frame::Success {
            id: 9,
            challenge: None
        }
    );
    assert_eq!(
        connection.authorized_principal(9),
        Some(Principal::Named("carol".into()))
    );
    assert_eq!(connection.live_server_auths(), 0);
    assert_eq!((stats.created(), stats.disposed()), (1, 1));

    connection.receive_auth_delete(9);
    assert_eq!(recorder.next_frame().await, Frame::DeleteAck { id: 9 });
    assert_eq!(connection.authorized_principal(9), None);
}

#[tokio::test]
async fn responder_challenges_before_success() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["C"], EndpointConfig::default()).await;

    connection.receive_auth_request(11, "C", Some(b"dave"));
    assert_eq!(
        recorder.next_frame().await,
        Frame::Challenge {
            id: 11,
            challenge: b"prove it".to_vec()
        }
    );
    assert_eq!(connection.live_server_auths(), 1);

    connection.receive_auth_response(11, b"dave");
    assert_eq!(
        recorder.next_frame().await,
        Frame::Success {
            id: 11,
            challenge: None
        }
    );
    assert_eq!(
        connection.authorized_principal(11),
        Some(Principal::Named("dave".into()))
    );
}

#[tokio::test]
async fn responder_ignores_reserved_ids_and_rejects_strays() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A"], EndpointConfig::default()).await;

    connection.receive_auth_request(0, "A", Some(b"eve"));
    connection.receive_auth_request(1, "A", Some(b"eve"));
    connection.receive_auth_response(1, b"eve");
    assert_eq!(recorder.try_next_frame(QUIET).await, None);
    assert_eq!(connection.authorized_principal(0), Some(Principal::Anonymous));

    connection.receive_auth_response(42, b"hello?");
    assert_eq!(recorder.next_frame().await, Frame::Reject { id: 42 });
}

// Initiator

#[tokio::test]
async fn exhausted_mechanisms_report_each_failure() {
    init_tracing();
    let clients = ScriptedClientFactory::new(["A", "B", "C"]);
    let client_stats = clients.stats();
    let domain = ScriptedDomain::new(SimpleSecurityDomain::new())
        .with_mechanism("A", Script::Reject)
        .with_mechanism("B", Script::Reject);
    let endpoint = Endpoint::builder()
        .security_domain(domain)
        .sasl_client_factory(clients)
        .build()
        .unwrap();
    let connection = endpoint
        .connect(&local_destination(), &AuthenticationConfiguration::anonymous(), None)
        .get()
        .await
        .unwrap();

    let err = connection
        .peer_identity_context()
        .authenticate(&user("bob"))
        .await
        .unwrap_err();
    assert_matches!(
        &err,
        RemotingError::AuthenticationFailed {
            kind: AuthFailureKind::MechanismsExhausted,
            ..
        }
    );
    let message = err.to_string();
    assert!(message.contains("A: "), "{message}");
    assert!(message.contains("B: "), "{message}");
    assert!(message.contains("server rejected A"), "{message}");
    assert!(message.contains("server rejected B"), "{message}");
    assert_eq!((client_stats.created(), client_stats.disposed()), (2, 2));
    assert_eq!(connection.peer_identity_context().active_authentications(), 0);
}

#[tokio::test]
async fn rejected_mechanisms_are_tried_in_order_then_released() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A", "B"], EndpointConfig::default()).await;
    let context = Arc::clone(connection.peer_identity_context());
    let future = context.authenticate_async(&user("bob"));

    let id = expect_request(&recorder, "A").await;
    assert!(id >= 2);
    context.receive_reject(id);
    assert_eq!(expect_request(&recorder, "B").await, id);
    context.receive_reject(id);

    assert_matches!(
        future.get().await,
        Err(RemotingError::AuthenticationFailed {
            kind: AuthFailureKind::MechanismsExhausted,
            ..
        })
    );
    assert_eq!(recorder.next_frame().await, Frame::Delete { id });
    assert_eq!(context.cached_identities(), 0);
}

#[tokio::test]
async fn initiator_completes_on_success() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["C"], EndpointConfig::default()).await;
    let context = Arc::clone(connection.peer_identity_context());
    let future = context.authenticate_async(&user("bob"));

    let id = expect_request(&recorder, "C").await;
    context.receive_challenge(id, b"prove it");
    assert_eq!(
        recorder.next_frame().await,
        Frame::Response {
            id,
            response: b"bob".to_vec()
        }
    );
    context.receive_success(id, None);

    let identity = future.get().await.unwrap();
    assert_eq!(identity.id(), id);
    assert_eq!(identity.principal(), &Principal::Named("bob".into()));
    assert_eq!(context.cached_identities(), 1);
    assert_eq!(context.active_authentications(), 0);

    assert_matches!(
        identity.open_channel("svc", None).get().await,
        Err(RemotingError::ServiceNotFound { .. })
    );
    assert_eq!(
        recorder.next_frame().await,
        Frame::Open {
            service: "svc".into(),
            identity: id
        }
    );
}

#[tokio::test]
async fn same_credential_shares_one_negotiation() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A"], EndpointConfig::default()).await;
    let context = Arc::clone(connection.peer_identity_context());

    let first = context.authenticate_async(&user("bob"));
    let second = context.authenticate_async(&user("bob"));
    assert!(first.ptr_eq(&second));
    let id = expect_request(&recorder, "A").await;
    assert_eq!(recorder.try_next_frame(QUIET).await, None);

    context.receive_success(id, None);
    assert_eq!(first.get().await.unwrap(), second.get().await.unwrap());
}

#[tokio::test]
async fn well_known_credentials_skip_negotiation() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A"], EndpointConfig::default()).await;
    let context = connection.peer_identity_context();

    let anonymous = context
        .authenticate(&AuthenticationConfiguration::anonymous())
        .await
        .unwrap();
    assert_eq!(anonymous.id(), 0);
    assert_eq!(recorder.try_next_frame(QUIET).await, None);
    assert_eq!(context.anonymous_identity().id(), 1);
}

#[tokio::test]
async fn extra_response_after_success_fails() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A"], EndpointConfig::default()).await;
    let context = Arc::clone(connection.peer_identity_context());
    let future = context.authenticate_async(&user("bob"));

    let id = expect_request(&recorder, "A").await;
    context.receive_success(id, Some(b"one more thing"));
    assert_matches!(
        future.get().await,
        Err(RemotingError::AuthenticationFailed {
            kind: AuthFailureKind::ExtraResponse,
            ..
        })
    );
}

#[tokio::test]
async fn server_delete_aborts_negotiation() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A", "B"], EndpointConfig::default()).await;
    let context = Arc::clone(connection.peer_identity_context());
    let future = context.authenticate_async(&user("bob"));

    let id = expect_request(&recorder, "A").await;
    context.receive_delete_ack(id);
    assert_matches!(
        future.get().await,
        Err(RemotingError::AuthenticationFailed {
            kind: AuthFailureKind::ServerRejected,
            ..
        })
    );
}

#[tokio::test]
async fn missing_client_mechanisms_fail_without_traffic() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["X", "Y"], EndpointConfig::default()).await;
    let err = connection
        .peer_identity_context()
        .authenticate(&AuthenticationConfiguration::for_user("bob"))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        RemotingError::AuthenticationFailed {
            kind: AuthFailureKind::NoSaslClient,
            ..
        }
    );
    // Only the release of the unused ID reaches the peer.
    assert_matches!(recorder.next_frame().await, Frame::Delete { .. });
}

#[tokio::test]
async fn connection_close_fails_inflight_negotiations() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A"], EndpointConfig::default()).await;
    let context = Arc::clone(connection.peer_identity_context());
    let future = context.authenticate_async(&user("bob"));
    expect_request(&recorder, "A").await;

    connection.close().await;
    assert_matches!(
        future.get().await,
        Err(RemotingError::AuthenticationFailed {
            kind: AuthFailureKind::ConnectionClosed,
            ..
        })
    );
    assert_eq!(recorder.next_frame().await, Frame::Closed);
    assert_matches!(
        context.authenticate(&user("carol")).await,
        Err(RemotingError::AuthenticationFailed {
            kind: AuthFailureKind::ConnectionClosed,
            ..
        })
    );
}

#[tokio::test]
async fn cancelled_negotiation_releases_its_id() {
    init_tracing();
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A"], EndpointConfig::default()).await;
    let context = Arc::clone(connection.peer_identity_context());
    let future = context.authenticate_async(&user("bob"));
    let id = expect_request(&recorder, "A").await;

    future.cancel();
    assert_eq!(future.status(), Status::Cancelled);
    assert_eq!(context.cached_identities(), 0);
    assert_eq!(recorder.next_frame().await, Frame::Delete { id });
}

#[tokio::test]
async fn unused_identities_are_evicted_when_the_cache_is_full() {
    init_tracing();
    let config = EndpointConfig {
        max_cached_identities: 1,
        ..EndpointConfig::default()
    };
    let (_endpoint, connection, recorder) = recorded(scripted(), &["A"], config).await;
    let context = Arc::clone(connection.peer_identity_context());

    let first = context.authenticate_async(&user("bob"));
    let bob_id = expect_request(&recorder, "A").await;
    context.receive_success(bob_id, None);
    drop(first.get().await.unwrap());
    drop(first);
    // Let the negotiation task release its handle on the result.
    tokio::time::sleep(QUIET).await;

    let held = context.authenticate_async(&user("carol"));
    assert_eq!(recorder.next_frame().await, Frame::Delete { id: bob_id });
    let carol_id = expect_request(&recorder, "A").await;
    context.receive_success(carol_id, None);
    let carol = held.get().await.unwrap();

    // Held identities stay cached even past the bound.
    let third = context.authenticate_async(&user("dave"));
    let dave_id = expect_request(&recorder, "A").await;
    assert_ne!(dave_id, carol_id);
    context.receive_success(dave_id, None);
    third.get().await.unwrap();
    assert_eq!(context.cached_identities(), 2);
    assert_eq!(carol.id(), carol_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_negotiations_never_share_an_id() {
    init_tracing();
    let domain = ScriptedDomain::new(SimpleSecurityDomain::new()).with_mechanism("A", Script::Accept);
    let endpoint = Endpoint::builder()
        .security_domain(domain)
        .sasl_client_factory(ScriptedClientFactory::new(["A"]))
        .build()
        .unwrap();
    let connection = endpoint
        .connect(&local_destination(), &AuthenticationConfiguration::anonymous(), None)
        .get()
        .await
        .unwrap();
    let context = Arc::clone(connection.peer_identity_context());

    let negotiations = (0..32).map(|n| {
        let context = Arc::clone(&context);
        tokio::spawn(async move { context.authenticate(&user(&format!("user-{n}"))).await })
    });
    let identities: Vec<_> = join_all(negotiations)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let ids: HashSet<u32> = identities.iter().map(|identity| identity.id()).collect();
    assert_eq!(ids.len(), identities.len());
    assert!(ids.iter().all(|id| *id >= 2));
    for identity in &identities {
        let server = endpoint
            .connections()
            .into_iter()
            .find(|candidate| !Arc::ptr_eq(candidate, &connection))
            .unwrap();
        assert_eq!(
            server.authorized_principal(identity.id()),
            Some(identity.principal().clone())
        );
    }
}
