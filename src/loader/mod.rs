//! YAML test manifests
//!
//! Every `*.testgrid.yaml` file under a directory declares fixtures and
//! suites whose bodies are shell commands:
//!
//! ```yaml
//! fixtures:
//!   - name: gem5
//!     setup: scons build/X86/gem5.opt && echo build/X86/gem5.opt
//!     build_once: true
//!     lazy: false
//! suites:
//!   - name: boot
//!     fail_fast: true
//!     fixtures: [gem5]
//!     tests:
//!       - name: hello
//!         command: $TESTGRID_FIXTURE_GEM5 configs/hello.py
//!       - list:
//!           fail_fast: true
//!           tests:
//!             - { name: checkpoint, command: ./checkpoint.sh }
//!             - { name: restore, command: ./restore.sh }
//! tests:
//!   - { name: lint, command: ./lint.sh }
//! ```
//!
//! Top-level `tests` land in a suite named after the manifest file.

mod command;

pub use command::{fixture_var, outcome_for_exit, shell_case, CommandResource, SKIP_EXIT_CODE};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::fixture::{ResourceSpec, Scope};
use crate::hierarchy::{Collector, TestCase, TestList, TestSuite, TestTree};

/// File name suffix marking a manifest
pub const MANIFEST_SUFFIXES: &[&str] = &[".testgrid.yaml", ".testgrid.yml"];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Overrides the module path derived from the file location
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub fixtures: Vec<FixtureDef>,
    #[serde(default)]
    pub suites: Vec<SuiteDef>,
    #[serde(default)]
    pub tests: Vec<ItemDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureDef {
    pub name: String,
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub teardown: Option<String>,
    /// Fixed value handed to dependents instead of setup's stdout
    #[serde(default)]
    pub export: Option<String>,
    #[serde(default = "default_lazy")]
    pub lazy: bool,
    #[serde(default)]
    pub build_once: bool,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_lazy() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteDef {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub fixtures: Vec<BindingDef>,
    #[serde(default)]
    pub tests: Vec<ItemDef>,
}

/// A fixture binding: `gem5`, or `{ name: binary, fixture: gem5 }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BindingDef {
    Name(String),
    Alias { name: String, fixture: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ItemDef {
    List { list: ListDef },
    Case(CaseDef),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListDef {
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub tests: Vec<ItemDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseDef {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fixtures: Vec<BindingDef>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid manifest: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        // An empty file is a manifest with nothing in it.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Register this manifest's fixtures and suites. Commands run in `dir`.
    pub fn register(self, collector: &mut Collector, module: &str, dir: &Path) {
        collector.module(self.module.as_deref().unwrap_or(module));

        for fixture in self.fixtures {
            collector.resource(fixture.into_spec(dir));
        }
        for suite in self.suites {
            collector.suite(suite.into_suite(dir));
        }
        if !self.tests.is_empty() {
            let name = module.rsplit('/').next().unwrap_or(module);
            let mut suite = TestSuite::new(name);
            for item in self.tests {
                suite = item.add_to_suite(suite, dir);
            }
            collector.suite(suite);
        }
    }
}

impl FixtureDef {
    fn into_spec(self, dir: &Path) -> ResourceSpec {
        let provider = CommandResource {
            setup: self.setup,
            teardown: self.teardown,
            export: self.export,
            dir: dir.to_path_buf(),
        };
        let mut spec = ResourceSpec::new(self.name, provider).scope(self.scope);
        if !self.lazy {
            spec = spec.eager();
        }
        if self.build_once {
            spec = spec.build_once();
        }
        for dep in self.depends_on {
            spec = spec.depends_on(dep);
        }
        spec
    }
}

impl BindingDef {
    fn parts(self) -> (String, String) {
        match self {
            BindingDef::Name(name) => (name.clone(), name),
            BindingDef::Alias { name, fixture } => (name, fixture),
        }
    }
}

impl SuiteDef {
    fn into_suite(self, dir: &Path) -> TestSuite {
        let mut suite = TestSuite::new(self.name);
        if self.fail_fast {
            suite = suite.fail_fast();
        }
        for tag in self.tags {
            suite = suite.tag(tag);
        }
        for binding in self.fixtures {
            let (name, fixture) = binding.parts();
            suite = suite.require_as(name, fixture);
        }
        for item in self.tests {
            suite = item.add_to_suite(suite, dir);
        }
        suite
    }
}

impl ItemDef {
    fn add_to_suite(self, suite: TestSuite, dir: &Path) -> TestSuite {
        match self {
            ItemDef::List { list } => suite.list(list.into_list(dir)),
            ItemDef::Case(case) => suite.case(case.into_case(dir)),
        }
    }

    fn add_to_list(self, list: TestList, dir: &Path) -> TestList {
        match self {
            ItemDef::List { list: inner } => list.list(inner.into_list(dir)),
            ItemDef::Case(case) => list.case(case.into_case(dir)),
        }
    }
}

impl ListDef {
    fn into_list(self, dir: &Path) -> TestList {
        let mut list = TestList::new();
        if self.fail_fast {
            list = list.fail_fast();
        }
        for item in self.tests {
            list = item.add_to_list(list, dir);
        }
        list
    }
}

impl CaseDef {
    fn into_case(self, dir: &Path) -> TestCase {
        let mut case = TestCase::new(self.name, shell_case(self.command, dir.to_path_buf()));
        if let Some(category) = self.category {
            case = case.category(category);
        }
        if let Some(variant) = self.variant {
            case = case.variant(variant);
        }
        for tag in self.tags {
            case = case.tag(tag);
        }
        for binding in self.fixtures {
            let (name, fixture) = binding.parts();
            case = case.require_as(name, fixture);
        }
        case
    }
}

fn is_manifest(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| MANIFEST_SUFFIXES.iter().any(|s| n.ends_with(s)))
        .unwrap_or(false)
}

/// Manifest files under `root`, sorted by path. `root` may be a manifest itself.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        for entry in entries {
            let path = entry
                .with_context(|| format!("Failed to read directory: {}", dir.display()))?
                .path();
            if path.is_dir() {
                let hidden = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(false);
                if !hidden {
                    pending.push(path);
                }
            } else if is_manifest(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Module path of a manifest: its location relative to `root`, minus the suffix
pub fn module_path(root: &Path, manifest: &Path) -> String {
    let relative = manifest.strip_prefix(root).unwrap_or(manifest);
    let relative = if relative.as_os_str().is_empty() {
        Path::new(manifest.file_name().unwrap_or_default())
    } else {
        relative
    };
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    MANIFEST_SUFFIXES
        .iter()
        .find_map(|s| joined.strip_suffix(s))
        .map(str::to_string)
        .unwrap_or(joined)
}

/// Discover, parse and register every manifest under `root`.
pub fn load_tree(root: impl AsRef<Path>) -> Result<TestTree> {
    let root = root.as_ref();
    let manifests = discover(root)?;
    if manifests.is_empty() {
        anyhow::bail!("No *.testgrid.yaml manifests found under {}", root.display());
    }

    let mut collector = Collector::new();
    for path in &manifests {
        let manifest = Manifest::load(path)?;
        let module = module_path(root, path);
        let dir = path.parent().unwrap_or(Path::new("."));
        debug!("Loaded manifest {} as module '{}'", path.display(), module);
        manifest.register(&mut collector, &module, dir);
    }

    let tree = collector
        .finish()
        .with_context(|| format!("Invalid test tree under {}", root.display()))?;
    info!(
        "Collected {} tests in {} suites from {} manifests",
        tree.case_count(),
        tree.suites().len(),
        manifests.len()
    );
    Ok(tree)
}
