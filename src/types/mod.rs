// ABOUTME: Validated domain types shared across the crate.
// ABOUTME: Currently the canonical host identity used by known_hosts lookups.

mod host_identity;

pub use host_identity::{DEFAULT_SSH_PORT, HostIdentity, HostIdentityError, normalize};
