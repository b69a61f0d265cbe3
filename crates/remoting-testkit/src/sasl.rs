//! Scripted SASL mechanisms
//!
//! The client sends the principal name as its initial response and answers
//! any non-empty challenge with the name again. The server follows its
//! [`Script`].

use remoting::sasl::{DefaultSaslClientFactory, SaslClient, SaslServer};
use remoting::{
    AuthenticationConfiguration, Principal, RemotingError, Result, SaslClientFactory,
    SaslServerFactory, SimpleSecurityDomain,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How a scripted server mechanism behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Accept the initial response
    Accept,
    /// Fail every response
    Reject,
    /// Send one challenge, then accept the answer
    ChallengeThenAccept,
}

/// Mechanism instance counters
#[derive(Debug, Default)]
pub struct MechanismStats {
    created: AtomicUsize,
    disposed: AtomicUsize,
}

impl MechanismStats {
    /// Instances created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Instances disposed
    pub fn disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Security domain with scripted mechanisms appended to a real one
#[derive(Clone)]
pub struct ScriptedDomain {
    inner: SimpleSecurityDomain,
    scripts: Vec<(String, Script)>,
    stats: Arc<MechanismStats>,
}

impl ScriptedDomain {
    /// Wrap `inner`
    pub fn new(inner: SimpleSecurityDomain) -> Self {
        Self {
            inner,
            scripts: Vec::new(),
            stats: Arc::new(MechanismStats::default()),
        }
    }

    /// Offer `name`, behaving as `script`
    pub fn with_mechanism(mut self, name: impl Into<String>, script: Script) -> Self {
        self.scripts.push((name.into(), script));
        self
    }

    /// Scripted server counters
    pub fn stats(&self) -> Arc<MechanismStats> {
        Arc::clone(&self.stats)
    }
}

impl SaslServerFactory for ScriptedDomain {
    fn mechanism_names(&self) -> Vec<String> {
        let mut names = self.inner.mechanism_names();
        names.extend(self.scripts.iter().map(|(name, _)| name.clone()));
        names
    }

    fn create_sasl_server(&self, mechanism: &str) -> Result<Box<dyn SaslServer>> {
        match self.scripts.iter().find(|(name, _)| name == mechanism) {
            Some((name, script)) => {
                self.stats.created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedServer {
                    name: name.clone(),
                    script: *script,
                    challenged: false,
                    principal: None,
                    stats: Arc::clone(&self.stats),
                }))
            }
            None => self.inner.create_sasl_server(mechanism),
        }
    }
}

struct ScriptedServer {
    name: String,
    script: Script,
    challenged: bool,
    principal: Option<Principal>,
    stats: Arc<MechanismStats>,
}

impl ScriptedServer {
    fn accept(&mut self, response: &[u8]) -> Vec<u8> {
        let name = String::from_utf8_lossy(response).into_owned();
        self.principal = Some(if name.is_empty() {
            Principal::Anonymous
        } else {
            Principal::Named(name)
        });
        Vec::new()
    }
}

impl SaslServer for ScriptedServer {
    fn mechanism_name(&self) -> &str {
        &self.name
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<Vec<u8>> {
        match self.script {
            Script::Reject => Err(RemotingError::sasl(format!("{} refuses everyone", self.name))),
            Script::Accept => Ok(self.accept(response)),
            Script::ChallengeThenAccept if !self.challenged => {
                self.challenged = true;
                Ok(b"prove it".to_vec())
            }
            Script::ChallengeThenAccept => Ok(self.accept(response)),
        }
    }

    fn is_complete(&self) -> bool {
        self.principal.is_some()
    }

    fn authorized_principal(&self) -> Option<Principal> {
        self.principal.clone()
    }

    fn dispose(&mut self) -> Result<()> {
        self.stats.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Client factory for scripted mechanisms; other mechanisms fall through
/// to [`DefaultSaslClientFactory`]
#[derive(Clone, Default)]
pub struct ScriptedClientFactory {
    mechanisms: Vec<String>,
    failures: HashMap<String, String>,
    stats: Arc<MechanismStats>,
}

impl ScriptedClientFactory {
    /// Clients for `mechanisms`, for named principals only
    pub fn new<I, S>(mechanisms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mechanisms: mechanisms.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Make client creation for `mechanism` fail with `reason`
    pub fn failing(mut self, mechanism: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failures.insert(mechanism.into(), reason.into());
        self
    }

    /// Scripted client counters
    pub fn stats(&self) -> Arc<MechanismStats> {
        Arc::clone(&self.stats)
    }
}

impl SaslClientFactory for ScriptedClientFactory {
    fn create_sasl_client(
        &self,
        mechanism: &str,
        config: &AuthenticationConfiguration,
    ) -> Result<Option<Box<dyn SaslClient>>> {
        if let Some(reason) = self.failures.get(mechanism) {
            return Err(RemotingError::sasl(reason.clone()));
        }
        if !self.mechanisms.iter().any(|name| name == mechanism) {
            return DefaultSaslClientFactory.create_sasl_client(mechanism, config);
        }
        match config.principal() {
            Principal::Named(name) if config.mechanism_allowed(mechanism) => {
                self.stats.created.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Box::new(ScriptedClient {
                    mechanism: mechanism.to_string(),
                    name: name.clone(),
                    sent: false,
                    complete: false,
                    stats: Arc::clone(&self.stats),
                })))
            }
            _ => Ok(None),
        }
    }
}

struct ScriptedClient {
    mechanism: String,
    name: String,
    sent: bool,
    complete: bool,
    stats: Arc<MechanismStats>,
}

impl SaslClient for ScriptedClient {
    fn mechanism_name(&self) -> &str {
        &self.mechanism
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        if !self.sent || !challenge.is_empty() {
            self.sent = true;
            return Ok(self.name.as_bytes().to_vec());
        }
        self.complete = true;
        Ok(Vec::new())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn dispose(&mut self) -> Result<()> {
        self.stats.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
