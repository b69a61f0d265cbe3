//! Service and provider registrations

use crate::channel::Channel;
use crate::closeable::{CloseTracker, HandleableCloseable};
use crate::config::ChannelOptions;
use crate::error::{RemotingError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Longest accepted service name
pub const MAX_SERVICE_NAME_LEN: usize = 64;

/// Receives channels opened to a registered service
pub trait OpenListener: Send + Sync {
    /// A peer opened a channel to the service
    fn channel_opened(&self, channel: Arc<dyn Channel>);

    /// The registration was closed; no further channels arrive
    fn registration_terminated(&self) {}
}

#[derive(Clone)]
pub(crate) struct ServiceEntry {
    pub listener: Arc<dyn OpenListener>,
    pub options: Option<ChannelOptions>,
}

/// Check a service name against `[A-Za-z0-9_.:-]+`, at most 64 characters
pub fn validate_service_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RemotingError::InvalidServiceName {
            name: name.to_string(),
        })
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// Handle for a registered service or connection provider.
///
/// Closing it deregisters what it names.
pub struct Registration {
    kind: &'static str,
    name: String,
    tracker: CloseTracker,
    release: Mutex<Option<Release>>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("open", &self.tracker.is_open())
            .finish()
    }
}

impl Registration {
    pub(crate) fn new(
        kind: &'static str,
        name: impl Into<String>,
        executor: Handle,
        release: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            kind,
            tracker: CloseTracker::new(format!("{kind} registration {name}"), executor),
            name,
            release: Mutex::new(Some(Box::new(release))),
        })
    }

    /// Registered service name or provider scheme
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl HandleableCloseable for Registration {
    fn close_tracker(&self) -> &CloseTracker {
        &self.tracker
    }

    async fn close_action(&self) -> Result<()> {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
        debug!(kind = self.kind, name = %self.name, "registration closed");
        self.tracker.close_complete(None);
        Ok(())
    }
}
