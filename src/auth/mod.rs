//! Authentication and authorization
//!
//! Two independent controls:
//! - Sender tokens: every message published through the core carries the
//!   sender `handle` and, when a secret is configured, a `token` proving it.
//! - Bridge permissions: the allowlist of channels external clients may
//!   publish to (inbound) or subscribe to (outbound).

mod permissions;
mod tokens;

pub use permissions::{ChannelPermission, Direction, PermissionSet};
pub use tokens::{
    Authenticity, SharedSecret, TokenError, TokenSigner, Verifier, TOKEN_DIGEST_LEN,
};
