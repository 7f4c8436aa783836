//! Unforgeable system-operation capability.
//!
//! Some read paths (bootstrap seeding, health probes) legitimately bypass
//! read-gating. Instead of inferring "is this a system call" from ambient
//! state, the trusted bootstrap constructs one [`CapabilityMint`] and hands
//! [`SystemCapability`] values only to callers it trusts. The authorizer
//! checks the capability by value against the mint that issued it.
//!
//! A capability never bypasses write-gating.

use nanoid::nanoid;

/// Length of the random capability body.
const CAPABILITY_BODY_LENGTH: usize = 32;

/// A by-value capability proving the holder was issued it by the mint.
///
/// The inner token is private; the only way to obtain a valid value is
/// [`CapabilityMint::issue`]. Cloning is allowed (a capability may be shared
/// between trusted components) but construction is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCapability(String);

/// Issues and verifies [`SystemCapability`] values.
///
/// Construct exactly one mint at process start, before any untrusted input
/// is handled, and keep it inside the authorizer.
#[derive(Debug)]
pub struct CapabilityMint {
    token: String,
}

impl CapabilityMint {
    /// Creates a mint with a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: nanoid!(CAPABILITY_BODY_LENGTH),
        }
    }

    /// Issues a capability backed by this mint.
    #[must_use]
    pub fn issue(&self) -> SystemCapability {
        SystemCapability(self.token.clone())
    }

    /// Returns true if `capability` was issued by this mint.
    #[must_use]
    pub fn verify(&self, capability: &SystemCapability) -> bool {
        // Constant-time comparison is unnecessary here: the token never
        // crosses a trust boundary in serialized form, so remote timing
        // probes have nothing to measure.
        capability.0 == self.token
    }
}

impl Default for CapabilityMint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_capability_verifies() {
        let mint = CapabilityMint::new();
        let capability = mint.issue();
        assert!(mint.verify(&capability));
    }

    #[test]
    fn foreign_capability_is_rejected() {
        let mint = CapabilityMint::new();
        let other = CapabilityMint::new();
        assert!(!mint.verify(&other.issue()));
    }

    #[test]
    fn clones_remain_valid() {
        let mint = CapabilityMint::new();
        let capability = mint.issue();
        assert!(mint.verify(&capability.clone()));
    }
}
