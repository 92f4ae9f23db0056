use sha2::{ Digest, Sha256 };
use std::fmt;

const UNKNOWN: &str = "unknown";
const GUEST_KEY_LEN: usize = 16;

/// Whose history an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    RegisteredUser(u64),
    Guest(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::RegisteredUser(id) => write!(f, "user:{}", id),
            Identity::Guest(key) => write!(f, "guest:{}", key),
        }
    }
}

/// What the hosting layer knows about the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub authenticated_user_id: Option<u64>,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
}

pub fn resolve_identity(explicit_user_id: Option<u64>, ctx: &RequestContext) -> Identity {
    if let Some(id) = explicit_user_id.filter(|id| *id > 0) {
        return Identity::RegisteredUser(id);
    }
    if let Some(id) = ctx.authenticated_user_id.filter(|id| *id > 0) {
        return Identity::RegisteredUser(id);
    }
    Identity::Guest(guest_key(ctx.remote_addr.as_deref(), ctx.user_agent.as_deref()))
}

/// Buckets anonymous callers by address and agent. Not an authentication mechanism.
pub fn guest_key(remote_addr: Option<&str>, user_agent: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote_addr.unwrap_or(UNKNOWN).as_bytes());
    hasher.update(user_agent.unwrap_or(UNKNOWN).as_bytes());
    let mut key = hex::encode(hasher.finalize());
    key.truncate(GUEST_KEY_LEN);
    key
}
