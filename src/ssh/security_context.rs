// ABOUTME: Capability interface for GSSAPI-style security context negotiation.
// ABOUTME: Tracks the context lifecycle so misuse surfaces as an error instead of UB.

use super::error::{Error, Result};

/// A ticket-based security context (e.g. Kerberos via GSSAPI).
///
/// Implementations own the cryptography; callers go through
/// [`SecurityContextState`], which enforces the call order.
pub trait SecurityContext: Send {
    /// Run one round of token exchange.
    ///
    /// Returns the token to send to the server and whether another round is
    /// needed. `token` is the server's reply from the previous round, empty on
    /// the first call.
    fn init_context(
        &mut self,
        target: &str,
        token: &[u8],
        want_delegation: bool,
    ) -> Result<(Vec<u8>, bool)>;

    /// Integrity tag (MIC) for `message` under the negotiated session key.
    fn integrity_check(&mut self, message: &[u8]) -> Result<Vec<u8>>;

    /// Release session material.
    fn destroy(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    Uninitialized,
    Establishing,
    Established,
    Failed,
    Destroyed,
}

/// Drives a [`SecurityContext`] through its lifecycle.
pub struct SecurityContextState<C> {
    context: C,
    phase: ContextPhase,
}

impl<C: SecurityContext> SecurityContextState<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            phase: ContextPhase::Uninitialized,
        }
    }

    pub fn phase(&self) -> ContextPhase {
        self.phase
    }

    /// Run one exchange round. Only valid before the context is established.
    pub fn step(&mut self, target: &str, token: &[u8], want_delegation: bool) -> Result<Vec<u8>> {
        match self.phase {
            ContextPhase::Uninitialized | ContextPhase::Establishing => {}
            phase => {
                return Err(Error::SecurityContext(format!(
                    "cannot continue negotiation in phase {:?}",
                    phase
                )));
            }
        }

        match self.context.init_context(target, token, want_delegation) {
            Ok((output, needs_continuation)) => {
                self.phase = if needs_continuation {
                    ContextPhase::Establishing
                } else {
                    ContextPhase::Established
                };
                tracing::debug!(target, phase = ?self.phase, "security context step");
                Ok(output)
            }
            Err(e) => {
                self.phase = ContextPhase::Failed;
                Err(e)
            }
        }
    }

    pub fn integrity_check(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        if self.phase != ContextPhase::Established {
            return Err(Error::SecurityContext(format!(
                "integrity check requires an established context, phase is {:?}",
                self.phase
            )));
        }
        self.context.integrity_check(message)
    }

    /// Tear down the context. Valid once, and only after establishment.
    pub fn destroy(&mut self) -> Result<()> {
        if self.phase != ContextPhase::Established {
            return Err(Error::SecurityContext(format!(
                "cannot destroy context in phase {:?}",
                self.phase
            )));
        }
        self.phase = ContextPhase::Destroyed;
        self.context.destroy()
    }
}

impl<C> std::fmt::Debug for SecurityContextState<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContextState")
            .field("phase", &self.phase)
            .finish()
    }
}
