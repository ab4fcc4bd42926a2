//! Caller-to-provider authorization hook.
//!
//! The router consults an [`AccessPolicy`] before selection; denied
//! providers are reported as `ACCESS_DENIED` outcomes and never called.

/// Decides whether a caller may use a provider.
pub trait AccessPolicy: Send + Sync {
    /// Returns true if `caller` may query `provider`.
    fn can_use(&self, caller: Option<&str>, provider: &str) -> bool;
}

/// Permits every caller to use every provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_use(&self, _caller: Option<&str>, _provider: &str) -> bool {
        true
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(Option<&str>, &str) -> bool + Send + Sync,
{
    fn can_use(&self, caller: Option<&str>, provider: &str) -> bool {
        self(caller, provider)
    }
}
