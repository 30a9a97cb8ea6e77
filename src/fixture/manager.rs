//! Fixture lifecycle manager
//!
//! Tracks every fixture through `Unbuilt -> Building -> Built | BuildFailed`
//! and `Built -> TornDown`. Concurrent acquirers of a fixture that is being
//! built block until the build resolves and then share its single result.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    BuildAuthority, BuildGrant, Handle, LocalAuthority, ResourceError, ResourceSpec, Resources,
    Scope,
};
use crate::utils::{panic_message, Timer};

/// Lifecycle state of a fixture
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Unbuilt,
    Building,
    Built,
    BuildFailed(String),
    TearingDown,
    TornDown,
}

#[derive(Debug)]
struct Slot {
    state: ResourceState,
    refs: usize,
    handle: Option<Handle>,
    /// Handle came from another builder; this process never tears it down
    adopted: bool,
    /// Teardown failed; the fixture is never rebuilt
    poisoned: bool,
    /// Dependencies held for the lifetime of the current build
    deps: Vec<String>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: ResourceState::Unbuilt,
            refs: 0,
            handle: None,
            adopted: false,
            poisoned: false,
            deps: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    build_order: Vec<String>,
}

enum Step {
    Ready(Handle),
    Wait,
    Fail(ResourceError),
    Build,
}

struct Built {
    handle: Handle,
    adopted: bool,
    deps: Vec<String>,
}

/// Owner of the build state of every fixture in a run
pub struct ResourceManager {
    specs: HashMap<String, ResourceSpec>,
    inner: Mutex<Inner>,
    changed: Condvar,
    authority: Arc<dyn BuildAuthority>,
    skip_build: bool,
}

impl ResourceManager {
    /// Register fixtures. Rejects duplicate names, unknown dependencies and
    /// dependency cycles.
    pub fn new(specs: impl IntoIterator<Item = ResourceSpec>) -> Result<Self, ResourceError> {
        let mut by_name = HashMap::new();
        let mut order = Vec::new();
        let mut slots = HashMap::new();

        for spec in specs {
            if by_name.contains_key(&spec.name) {
                return Err(ResourceError::Duplicate(spec.name));
            }
            order.push(spec.name.clone());
            slots.insert(spec.name.clone(), Slot::new());
            by_name.insert(spec.name.clone(), spec);
        }

        for name in &order {
            for dep in &by_name[name].depends_on {
                if !by_name.contains_key(dep) {
                    return Err(ResourceError::UnknownDependency {
                        resource: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        detect_cycle(&by_name, &order)?;

        Ok(Self {
            specs: by_name,
            inner: Mutex::new(Inner {
                slots,
                build_order: Vec::new(),
            }),
            changed: Condvar::new(),
            authority: Arc::new(LocalAuthority),
            skip_build: false,
        })
    }

    /// Use a different authority for `build_once` fixtures
    pub fn with_authority(mut self, authority: Arc<dyn BuildAuthority>) -> Self {
        self.authority = authority;
        self
    }

    /// Treat `build_once` fixtures as already built by an external step
    pub fn skip_build(mut self, skip: bool) -> Self {
        self.skip_build = skip;
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&ResourceSpec> {
        self.specs.get(name)
    }

    pub fn state(&self, name: &str) -> Option<ResourceState> {
        self.inner.lock().slots.get(name).map(|s| s.state.clone())
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.inner.lock().slots.get(name).map(|s| s.refs).unwrap_or(0)
    }

    /// Take a reference to a fixture, building it first if needed.
    pub fn acquire(&self, name: &str) -> Result<Handle, ResourceError> {
        self.obtain(name, true)
    }

    /// Build a fixture without taking a reference to it.
    pub fn ensure_built(&self, name: &str) -> Result<(), ResourceError> {
        self.obtain(name, false).map(|_| ())
    }

    /// Pin a fixture without building it, so it outlives the cases that use it.
    pub fn retain(&self, name: &str) -> Result<(), ResourceError> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(name)
            .ok_or_else(|| ResourceError::Unknown(name.to_string()))?;
        slot.refs += 1;
        Ok(())
    }

    /// Drop a reference. The last reference to a built fixture that is
    /// neither `build_once` nor global-scoped tears it down.
    pub fn release(&self, name: &str) {
        let Some(spec) = self.specs.get(name) else {
            return;
        };

        let target = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.slots.get_mut(name) else {
                return;
            };
            slot.refs = slot.refs.saturating_sub(1);

            if slot.refs == 0
                && slot.state == ResourceState::Built
                && !spec.build_once
                && spec.scope != Scope::Global
            {
                slot.state = ResourceState::TearingDown;
                Some(take_build(slot))
            } else {
                None
            }
        };

        if let Some((handle, adopted, deps)) = target {
            self.finish_teardown(spec, handle, adopted, deps);
        }
    }

    /// Build every non-lazy fixture among `names`. Failures are returned and
    /// stay sticky: later acquirers see the same build error.
    pub fn build_eager<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<ResourceError> {
        let mut seen = HashSet::new();
        let mut failures = Vec::new();

        for name in names {
            if !seen.insert(name) {
                continue;
            }
            let Some(spec) = self.specs.get(name) else {
                failures.push(ResourceError::Unknown(name.to_string()));
                continue;
            };
            if spec.lazy {
                continue;
            }
            if let Err(e) = self.ensure_built(name) {
                warn!("Failed to build non-lazy fixture '{}': {}", name, e);
                failures.push(e);
            }
        }

        failures
    }

    /// Tear down everything still built, in reverse build order.
    pub fn shutdown(&self) {
        let order = self.inner.lock().build_order.clone();
        if !order.is_empty() {
            info!("Tearing down {} fixture(s)", order.len());
        }

        for name in order.iter().rev() {
            let Some(spec) = self.specs.get(name) else {
                continue;
            };
            let target = {
                let mut inner = self.inner.lock();
                match inner.slots.get_mut(name) {
                    Some(slot) if slot.state == ResourceState::Built => {
                        slot.state = ResourceState::TearingDown;
                        Some(take_build(slot))
                    }
                    _ => None,
                }
            };
            if let Some((handle, adopted, deps)) = target {
                self.finish_teardown(spec, handle, adopted, deps);
            }
        }
    }

    fn obtain(&self, name: &str, take_ref: bool) -> Result<Handle, ResourceError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| ResourceError::Unknown(name.to_string()))?;

        {
            let mut inner = self.inner.lock();
            loop {
                let step = match inner.slots.get_mut(name) {
                    None => Step::Fail(ResourceError::Unknown(name.to_string())),
                    Some(slot) => match &slot.state {
                        ResourceState::Built => match &slot.handle {
                            Some(handle) => {
                                if take_ref {
                                    slot.refs += 1;
                                }
                                Step::Ready(handle.clone())
                            }
                            None => Step::Fail(ResourceError::Unavailable(name.to_string())),
                        },
                        ResourceState::Building | ResourceState::TearingDown => Step::Wait,
                        ResourceState::BuildFailed(cause) => {
                            Step::Fail(ResourceError::build(name, cause))
                        }
                        ResourceState::TornDown if slot.poisoned || spec.build_once => {
                            Step::Fail(ResourceError::Unavailable(name.to_string()))
                        }
                        ResourceState::Unbuilt | ResourceState::TornDown => {
                            slot.state = ResourceState::Building;
                            Step::Build
                        }
                    },
                };

                match step {
                    Step::Ready(handle) => return Ok(handle),
                    Step::Fail(e) => return Err(e),
                    Step::Wait => self.changed.wait(&mut inner),
                    Step::Build => break,
                }
            }
        }

        let built = self.build(spec);

        let result = {
            let mut guard = self.inner.lock();
            let Inner { slots, build_order } = &mut *guard;
            match (slots.get_mut(name), built) {
                (Some(slot), Ok(built)) => {
                    slot.state = ResourceState::Built;
                    slot.handle = Some(built.handle.clone());
                    slot.adopted = built.adopted;
                    slot.deps = built.deps;
                    if take_ref {
                        slot.refs += 1;
                    }
                    build_order.push(name.to_string());
                    Ok(built.handle)
                }
                (Some(slot), Err(cause)) => {
                    slot.state = ResourceState::BuildFailed(cause.clone());
                    Err(ResourceError::build(name, cause))
                }
                (None, _) => Err(ResourceError::Unknown(name.to_string())),
            }
        };
        self.changed.notify_all();
        result
    }

    fn build(&self, spec: &ResourceSpec) -> Result<Built, String> {
        let mut deps = Resources::new();
        let mut held = Vec::new();

        for dep in &spec.depends_on {
            match self.acquire(dep) {
                Ok(handle) => {
                    deps.insert(dep.clone(), handle);
                    held.push(dep.clone());
                }
                Err(e) => {
                    self.release_all(&held);
                    return Err(format!("dependency '{dep}' unavailable: {e}"));
                }
            }
        }

        match self.build_provider(spec, &deps) {
            Ok((handle, adopted)) => Ok(Built {
                handle,
                adopted,
                deps: held,
            }),
            Err(cause) => {
                self.release_all(&held);
                Err(cause)
            }
        }
    }

    fn build_provider(&self, spec: &ResourceSpec, deps: &Resources) -> Result<(Handle, bool), String> {
        if spec.build_once && self.skip_build {
            info!("Skipping build of '{}'", spec.name);
            return guarded(|| spec.provider.prebuilt()).map(|h| (h, true));
        }

        if spec.build_once {
            match self.authority.claim(&spec.name) {
                Ok(BuildGrant::Build) => {}
                Ok(BuildGrant::Reuse(reference)) => {
                    debug!("Reusing fixture '{}' built elsewhere", spec.name);
                    return guarded(|| spec.provider.adopt(reference.as_deref())).map(|h| (h, true));
                }
                Ok(BuildGrant::Failed(cause)) => return Err(cause),
                Err(e) => return Err(e.to_string()),
            }
        }

        debug!("Building fixture '{}'", spec.name);
        let timer = Timer::start(format!("fixture {}", spec.name));
        let result = guarded(|| spec.provider.setup(deps));
        timer.finish();

        if spec.build_once {
            let report = match &result {
                Ok(handle) => Ok(spec.provider.export(handle)),
                Err(cause) => Err(cause.clone()),
            };
            self.authority.report(&spec.name, report);
        }

        result.map(|h| (h, false))
    }

    fn finish_teardown(
        &self,
        spec: &ResourceSpec,
        handle: Option<Handle>,
        adopted: bool,
        deps: Vec<String>,
    ) {
        let mut failed = false;
        if let (Some(handle), false) = (handle, adopted) {
            debug!("Tearing down fixture '{}'", spec.name);
            if let Err(e) = guarded(|| spec.provider.teardown(&handle)) {
                warn!("Teardown of fixture '{}' failed: {}", spec.name, e);
                failed = true;
            }
        }

        {
            let mut guard = self.inner.lock();
            let Inner { slots, build_order } = &mut *guard;
            if let Some(slot) = slots.get_mut(&spec.name) {
                slot.state = ResourceState::TornDown;
                slot.poisoned |= failed;
            }
            build_order.retain(|n| n != &spec.name);
        }
        self.changed.notify_all();

        self.release_all(&deps);
    }

    fn release_all(&self, names: &[String]) {
        for name in names {
            self.release(name);
        }
    }
}

fn take_build(slot: &mut Slot) -> (Option<Handle>, bool, Vec<String>) {
    (
        slot.handle.take(),
        slot.adopted,
        std::mem::take(&mut slot.deps),
    )
}

/// Run a provider callback, turning errors and panics into a cause string.
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn detect_cycle(specs: &HashMap<String, ResourceSpec>, order: &[String]) -> Result<(), ResourceError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        specs: &'a HashMap<String, ResourceSpec>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), ResourceError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Err(ResourceError::Cycle(cycle));
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        path.push(name);
        for dep in &specs[name].depends_on {
            visit(dep, specs, marks, path)?;
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for name in order {
        visit(name, specs, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}
