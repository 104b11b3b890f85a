//! Pool identity.

use std::fmt;

/// Key identifying a connection pool: configurations with the same
/// `(host, port, namespace)` triple share one pool, whatever their other
/// fields say.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetIdentity {
    pub host: String,
    pub port: u16,
    pub namespace: u32,
}

impl TargetIdentity {
    pub fn new(host: &str, port: u16, namespace: u32) -> Self {
        Self {
            host: host.to_string(),
            port,
            namespace,
        }
    }
}

impl fmt::Display for TargetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.namespace)
    }
}
