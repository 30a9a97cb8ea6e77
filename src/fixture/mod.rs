//! Fixtures (resources)
//!
//! A fixture is a named unit of setup/teardown state that tests depend on.
//! The [`ResourceManager`] owns the build state of every fixture; test items
//! only ever refer to fixtures by name.

mod authority;
mod manager;

pub use authority::{BuildAuthority, BuildGrant, LocalAuthority};
pub use manager::{ResourceManager, ResourceState};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Fixture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Unknown resource: {0}")]
    Unknown(String),

    #[error("Failed to build resource '{name}': {cause}")]
    Build { name: String, cause: String },

    #[error("Resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency { resource: String, dependency: String },

    #[error("Resource dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Duplicate resource name: {0}")]
    Duplicate(String),

    #[error("Resource '{0}' is no longer available")]
    Unavailable(String),
}

impl ResourceError {
    pub fn build(name: impl Into<String>, cause: impl fmt::Display) -> Self {
        ResourceError::Build {
            name: name.into(),
            cause: cause.to_string(),
        }
    }
}

/// Type-erased handle to a built fixture
#[derive(Clone)]
pub struct Handle(Arc<dyn Any + Send + Sync>);

impl Handle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Handle carrying no value, for fixtures that only have side effects
    pub fn unit() -> Self {
        Self::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether two handles point at the same built value
    pub fn same_as(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").finish_non_exhaustive()
    }
}

/// Built fixtures visible to a test body or to a dependent fixture, keyed by
/// binding name.
#[derive(Clone, Debug, Default)]
pub struct Resources {
    handles: HashMap<String, Handle>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, handle: Handle) {
        self.handles.insert(name.into(), handle);
    }

    pub fn handle(&self, name: &str) -> Option<&Handle> {
        self.handles.get(name)
    }

    /// Typed access to a bound fixture
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.handles.get(name).and_then(|h| h.downcast_ref::<T>())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Handle)> {
        self.handles.iter().map(|(name, handle)| (name.as_str(), handle))
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Setup/teardown contract implemented by fixture providers.
pub trait Resource: Send + Sync {
    /// Build the fixture. `deps` holds the handles of declared dependencies.
    fn setup(&self, deps: &Resources) -> Result<Handle>;

    /// Tear the fixture down. Errors are logged by the manager, never raised.
    fn teardown(&self, _handle: &Handle) -> Result<()> {
        Ok(())
    }

    /// Portable reference to a built handle, shared with other workers when
    /// the fixture is built once for the whole fleet.
    fn export(&self, _handle: &Handle) -> Option<String> {
        None
    }

    /// Reconstruct a handle from a reference exported by another process.
    fn adopt(&self, _reference: Option<&str>) -> Result<Handle> {
        anyhow::bail!("fixture cannot be adopted from a remote build")
    }

    /// Handle used when builds are skipped because an external step already
    /// produced the artifact.
    fn prebuilt(&self) -> Result<Handle> {
        self.adopt(None)
    }
}

type SetupFn<T> = Box<dyn Fn(&Resources) -> Result<T> + Send + Sync>;
type TeardownFn<T> = Box<dyn Fn(&T) -> Result<()> + Send + Sync>;
type ExportFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type AdoptFn<T> = Box<dyn Fn(Option<&str>) -> Result<T> + Send + Sync>;

/// Closure-backed fixture
pub struct FnResource<T> {
    setup: SetupFn<T>,
    teardown: Option<TeardownFn<T>>,
    export: Option<ExportFn<T>>,
    adopt: Option<AdoptFn<T>>,
}

impl<T: Any + Send + Sync> FnResource<T> {
    pub fn new(setup: impl Fn(&Resources) -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            setup: Box::new(setup),
            teardown: None,
            export: None,
            adopt: None,
        }
    }

    pub fn on_teardown(mut self, f: impl Fn(&T) -> Result<()> + Send + Sync + 'static) -> Self {
        self.teardown = Some(Box::new(f));
        self
    }

    pub fn exported(mut self, f: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.export = Some(Box::new(f));
        self
    }

    pub fn adopted(
        mut self,
        f: impl Fn(Option<&str>) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.adopt = Some(Box::new(f));
        self
    }
}

impl<T: Any + Send + Sync> Resource for FnResource<T> {
    fn setup(&self, deps: &Resources) -> Result<Handle> {
        (self.setup)(deps).map(Handle::new)
    }

    fn teardown(&self, handle: &Handle) -> Result<()> {
        match (&self.teardown, handle.downcast_ref::<T>()) {
            (Some(teardown), Some(value)) => teardown(value),
            _ => Ok(()),
        }
    }

    fn export(&self, handle: &Handle) -> Option<String> {
        let export = self.export.as_ref()?;
        handle.downcast_ref::<T>().map(|v| export(v))
    }

    fn adopt(&self, reference: Option<&str>) -> Result<Handle> {
        match &self.adopt {
            Some(adopt) => adopt(reference).map(Handle::new),
            None => anyhow::bail!("fixture cannot be adopted from a remote build"),
        }
    }
}

/// Lifetime owner of a fixture
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Kept until the run ends
    Global,
    /// Torn down after the last case of the suite holding it
    Suite,
    /// Torn down once the last case referencing it has finished
    #[default]
    Case,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Suite => write!(f, "suite"),
            Scope::Case => write!(f, "case"),
        }
    }
}

/// Declaration of a fixture: its flags, dependencies and provider
#[derive(Clone)]
pub struct ResourceSpec {
    pub name: String,
    /// Defer the build until the first test references it
    pub lazy: bool,
    /// At most one build per run (or per fleet in distributed mode)
    pub build_once: bool,
    pub scope: Scope,
    pub depends_on: Vec<String>,
    pub provider: Arc<dyn Resource>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, provider: impl Resource + 'static) -> Self {
        Self {
            name: name.into(),
            lazy: true,
            build_once: false,
            scope: Scope::Case,
            depends_on: Vec::new(),
            provider: Arc::new(provider),
        }
    }

    /// Fixture whose setup is a closure returning the fixture value
    pub fn from_fn<T: Any + Send + Sync>(
        name: impl Into<String>,
        setup: impl Fn(&Resources) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, FnResource::new(setup))
    }

    /// Build at engine start instead of on first use
    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }

    pub fn build_once(mut self) -> Self {
        self.build_once = true;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }
}

impl fmt::Debug for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSpec")
            .field("name", &self.name)
            .field("lazy", &self.lazy)
            .field("build_once", &self.build_once)
            .field("scope", &self.scope)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_typed_access() {
        let mut resources = Resources::new();
        resources.insert("port", Handle::new(8080u16));

        assert_eq!(resources.get::<u16>("port"), Some(&8080));
        assert_eq!(resources.get::<String>("port"), None);
        assert!(resources.get::<u16>("missing").is_none());
    }

    #[test]
    fn test_spec_builder() {
        let spec = ResourceSpec::from_fn("tool", |_| Ok(()))
            .eager()
            .build_once()
            .scope(Scope::Global)
            .depends_on("compiler");

        assert!(!spec.lazy);
        assert!(spec.build_once);
        assert_eq!(spec.scope, Scope::Global);
        assert_eq!(spec.depends_on, vec!["compiler".to_string()]);
    }

    #[test]
    fn test_fn_resource_export_and_adopt() {
        let resource = FnResource::new(|_| Ok("/opt/tool".to_string()))
            .exported(|path: &String| path.clone())
            .adopted(|reference| Ok(reference.unwrap_or_default().to_string()));

        let handle = resource.setup(&Resources::new()).unwrap();
        assert_eq!(resource.export(&handle).as_deref(), Some("/opt/tool"));

        let adopted = resource.adopt(Some("/opt/tool")).unwrap();
        assert_eq!(adopted.downcast_ref::<String>().unwrap(), "/opt/tool");
    }

    #[test]
    fn test_fn_resource_without_adopter() {
        let resource = FnResource::new(|_| Ok(1u32));
        assert!(resource.adopt(Some("x")).is_err());
        assert!(resource.prebuilt().is_err());
    }
}
