//! Remoting test fixtures
//!
//! Shared helpers for the integration tests of the `remoting` crate:
//! tracing set-up, service listeners that hand channels to the test, a
//! connection provider that counts and gates connects, a provider whose
//! connections record every frame they send, and scripted SASL mechanisms.
//!
//! ```rust,no_run
//! # async fn demo() {
//! use remoting_testkit::*;
//!
//! init_tracing();
//! let (endpoint, destination) = local_endpoint();
//! let echo = EchoService::new();
//! endpoint.register_service("echo", echo, None).unwrap();
//! # let _ = destination;
//! # }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod logging;
pub mod providers;
pub mod sasl;
pub mod services;

pub use logging::init_tracing;
pub use providers::{CountingProviderFactory, Frame, Recorder, RecordingProviderFactory};
pub use sasl::{MechanismStats, Script, ScriptedClientFactory, ScriptedDomain};
pub use services::{ChannelCollector, EchoService};

use remoting::{Endpoint, EndpointConfig};
use std::sync::Arc;
use url::Url;

/// `local:` destination URL
pub fn local_destination() -> Url {
    Url::parse("local:peer").unwrap()
}

/// Endpoint on the ambient runtime with the default local provider
pub fn local_endpoint() -> (Arc<Endpoint>, Url) {
    let endpoint = Endpoint::builder().endpoint_name("test").build().unwrap();
    (endpoint, local_destination())
}

/// Endpoint configuration whose connections allow identity switching
pub fn sharing_config(remote_auth: bool) -> EndpointConfig {
    let mut config = EndpointConfig::default();
    config.connection.remote_auth = remote_auth;
    config
}
