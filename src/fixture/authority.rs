//! Build authority
//!
//! Decides who builds a `build_once` fixture. In a single process the local
//! manager is its own authority; a worker defers to the coordinator.

use super::ResourceError;

/// Answer to a build claim
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildGrant {
    /// Caller is the builder and must report the outcome
    Build,
    /// Another builder succeeded; reuse its exported reference
    Reuse(Option<String>),
    /// Another builder failed
    Failed(String),
}

pub trait BuildAuthority: Send + Sync {
    /// Ask whether the named fixture still needs building. May block until a
    /// concurrent builder resolves.
    fn claim(&self, name: &str) -> Result<BuildGrant, ResourceError>;

    /// Report the outcome of a granted build: the exported reference on
    /// success, the failure cause otherwise.
    fn report(&self, name: &str, result: Result<Option<String>, String>);
}

/// Authority for single-process runs; the manager's own state already
/// guarantees one build per fixture.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalAuthority;

impl BuildAuthority for LocalAuthority {
    fn claim(&self, _name: &str) -> Result<BuildGrant, ResourceError> {
        Ok(BuildGrant::Build)
    }

    fn report(&self, _name: &str, _result: Result<Option<String>, String>) {}
}
