//! Credential configuration used as the sharing and de-duplication key

use std::collections::BTreeSet;
use std::fmt;

/// An authenticated principal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Principal {
    /// The anonymous principal
    Anonymous,
    /// A named principal
    Named(String),
}

impl Principal {
    /// Principal name, `"anonymous"` for the anonymous principal
    pub fn name(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How to authenticate: who, with what secret, over which mechanisms.
///
/// Compared and hashed by value; two equal configurations share a cached
/// connection and identity.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AuthenticationConfiguration {
    principal: Principal,
    password: Option<String>,
    allowed: Option<BTreeSet<String>>,
    forbidden: BTreeSet<String>,
}

impl AuthenticationConfiguration {
    /// Authenticate as the anonymous principal
    pub fn anonymous() -> Self {
        Self {
            principal: Principal::Anonymous,
            password: None,
            allowed: None,
            forbidden: BTreeSet::new(),
        }
    }

    /// Authenticate as `name`
    pub fn for_user(name: impl Into<String>) -> Self {
        Self {
            principal: Principal::Named(name.into()),
            ..Self::anonymous()
        }
    }

    /// Use `password` as the secret
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Restrict negotiation to these mechanisms
    pub fn allow_mechanisms<I, S>(mut self, mechanisms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(mechanisms.into_iter().map(Into::into).collect());
        self
    }

    /// Never negotiate these mechanisms
    pub fn forbid_mechanisms<I, S>(mut self, mechanisms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden.extend(mechanisms.into_iter().map(Into::into));
        self
    }

    /// Principal to authenticate as
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Secret, if any
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Whether this configuration resolves to the anonymous principal
    pub fn is_anonymous(&self) -> bool {
        self.principal == Principal::Anonymous
    }

    /// Whether `mechanism` may be used
    pub fn mechanism_allowed(&self, mechanism: &str) -> bool {
        if self.forbidden.contains(mechanism) {
            return false;
        }
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(mechanism))
    }
}

impl Default for AuthenticationConfiguration {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Debug for AuthenticationConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationConfiguration")
            .field("principal", &self.principal)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("allowed", &self.allowed)
            .field("forbidden", &self.forbidden)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_is_by_value() {
        let a = AuthenticationConfiguration::for_user("bob").with_password("pw");
        let b = AuthenticationConfiguration::for_user("bob").with_password("pw");
        let c = AuthenticationConfiguration::for_user("bob").with_password("other");
        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = AuthenticationConfiguration::for_user("bob").with_password("hunter2");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_mechanism_filters() {
        let config = AuthenticationConfiguration::anonymous()
            .allow_mechanisms(["PLAIN", "ANONYMOUS"])
            .forbid_mechanisms(["ANONYMOUS"]);
        assert!(config.mechanism_allowed("PLAIN"));
        assert!(!config.mechanism_allowed("ANONYMOUS"));
        assert!(!config.mechanism_allowed("DIGEST-MD5"));
        assert!(AuthenticationConfiguration::anonymous().mechanism_allowed("anything"));
    }
}
