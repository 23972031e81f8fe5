//! Service request handling (RFC 4253 section 10).
//!
//! After key exchange a client requests a named service (for example
//! `ssh-userauth`). A server accepts services that were registered with it
//! and disconnects on anything else.

/// The userauth service name.
pub const SSH_USERAUTH: &str = "ssh-userauth";

/// The connection service name.
pub const SSH_CONNECTION: &str = "ssh-connection";

/// Names of services a server is willing to accept.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<String>,
}

impl ServiceRegistry {
    /// Creates an empty registry; every request will be refused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service name.
    pub fn register(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        if !self.services.contains(&name) {
            self.services.push(name);
        }
        self
    }

    /// Whether `name` was registered.
    pub fn contains(&self, name: &str) -> bool {
        self.services.iter().any(|s| s == name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.services
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_membership() {
        let mut registry = ServiceRegistry::new();
        registry.register(SSH_USERAUTH);
        assert!(registry.contains("ssh-userauth"));
        assert!(!registry.contains("ssh-connection"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = ServiceRegistry::new();
        registry.register(SSH_USERAUTH).register(SSH_USERAUTH);
        assert_eq!(registry.names().len(), 1);
    }
}
