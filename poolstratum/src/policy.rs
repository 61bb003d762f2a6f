//! Call-site contract for the (externally owned) policy engine.
//!
//! Spec §1 scopes the policy engine's internal rules out — ban-list
//! storage, rate-limit algorithms — but the call sites and their effect
//! on control flow are part of the core (SPEC_FULL.md §2). `PolicyOracle`
//! models exactly that boundary: a boolean oracle the Stratum server
//! consults, with a permissive in-memory default for tests and
//! standalone runs.

use async_trait::async_trait;

#[async_trait]
pub trait PolicyOracle: Send + Sync {
    async fn is_banned(&self, ip: &str) -> bool;

    /// Called whenever an inbound line would exceed the frame limit or the
    /// connection rate otherwise looks abusive. Returning `true` bans the
    /// offending ip going forward.
    async fn apply_limit_policy(&self, ip: &str) -> bool;

    /// Called on a request that fails to parse or dispatches to an
    /// unknown method.
    async fn apply_malformed_policy(&self, ip: &str) -> bool;

    /// Called on `mining.authorize`; returning `false` rejects the login.
    async fn apply_login_policy(&self, ip: &str, login: &str) -> bool;

    /// Called on an invalid share; returning `true` means this occurrence
    /// is fatal (close the session with error 23) rather than silently
    /// dropped, per `handlers.go: handleSubmitRPC`.
    async fn apply_share_policy(&self, ip: &str, login: &str) -> bool;
}

/// Never bans, never rejects: the default used when no external policy
/// engine is wired in.
#[derive(Default)]
pub struct PermissivePolicy;

#[async_trait]
impl PolicyOracle for PermissivePolicy {
    async fn is_banned(&self, _ip: &str) -> bool {
        false
    }

    async fn apply_limit_policy(&self, _ip: &str) -> bool {
        false
    }

    async fn apply_malformed_policy(&self, _ip: &str) -> bool {
        false
    }

    async fn apply_login_policy(&self, _ip: &str, _login: &str) -> bool {
        true
    }

    async fn apply_share_policy(&self, _ip: &str, _login: &str) -> bool {
        false
    }
}
