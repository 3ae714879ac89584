//! Engine Registry
//!
//! Holds one [`EngineInfo`] per engine name and, once created, one engine
//! singleton per name.  Dependencies between engines are declared at
//! registration and honoured twice: [`EngineRegistry::create`] instantiates
//! dependencies first, and [`EngineRegistry::get_load_order`] returns a
//! topological order (Kahn's algorithm, ties broken by priority then name).
//!
//! # Locking:
//! - `engines` (records) and `instances` (singletons) are separate
//!   `RwLock`s, never held across a constructor call
//! - The registry has no lock shared with the installer

use serde_json::{Map, Value};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::engine::backends;
use crate::engine::isolation::{Capability, EngineKind, IsolationEngine, REQUIRED_CAPABILITIES};
use crate::error::{Error, Result};
use crate::util::{read, write};

/// Constructor for one engine kind: `(name, merged config) → engine`.
pub type EngineConstructor = fn(&str, &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>>;

/// How to build an engine of one kind.
#[derive(Clone)]
pub struct EngineFactory {
    kind: EngineKind,
    capabilities: BTreeSet<Capability>,
    constructor: EngineConstructor,
}

impl EngineFactory {
    /// Factory declaring the kind's standard capabilities.
    pub fn new(kind: EngineKind, constructor: EngineConstructor) -> Self {
        Self {
            kind,
            capabilities: kind.capabilities(),
            constructor,
        }
    }

    /// Override the declared capability set.
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn build(&self, name: &str, config: &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>> {
        (self.constructor)(name, config)
    }
}

impl fmt::Debug for EngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineFactory")
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Registry record for one engine.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub name: String,
    pub factory: EngineFactory,
    /// Engines that must exist before this one
    pub dependencies: Vec<String>,
    /// Lower loads first
    pub priority: i32,
    /// Schema defaults; caller overrides are merged on top
    pub defaults: Map<String, Value>,
}

impl EngineInfo {
    pub fn new(name: impl Into<String>, factory: EngineFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            dependencies: Vec::new(),
            priority: 0,
            defaults: Map::new(),
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, EngineInfo>>,
    /// Overrides applied whenever the engine is instantiated
    configured: RwLock<HashMap<String, Map<String, Value>>>,
    instances: RwLock<HashMap<String, Arc<dyn IsolationEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `basic`, `virtualenv` and `container`.
    pub fn with_builtin_engines() -> Result<Self> {
        let registry = Self::new();
        registry.register_builtin_engines()?;
        Ok(registry)
    }

    pub fn register_builtin_engines(&self) -> Result<()> {
        for kind in EngineKind::ALL {
            self.register(backends::builtin_info(kind), false)?;
        }
        Ok(())
    }

    /// Register an engine.
    ///
    /// Replacing an engine drops its cached singleton so the next `create`
    /// uses the new factory.
    pub fn register(&self, info: EngineInfo, replace: bool) -> Result<()> {
        if info.name.trim().is_empty() {
            return Err(Error::InvalidEngine {
                name: info.name,
                reason: "empty engine name".into(),
            });
        }
        let missing: Vec<String> = REQUIRED_CAPABILITIES
            .iter()
            .filter(|c| !info.factory.capabilities().contains(c))
            .map(|c| format!("{c:?}"))
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidEngine {
                name: info.name,
                reason: format!("missing required capabilities: {}", missing.join(", ")),
            });
        }

        let mut engines = write(&self.engines);
        if engines.contains_key(&info.name) && !replace {
            return Err(Error::DuplicateEngine(info.name));
        }
        if let Some(dependency) = info
            .dependencies
            .iter()
            .find(|d| !engines.contains_key(d.as_str()) && **d != info.name)
        {
            return Err(Error::UnmetDependency {
                engine: info.name.clone(),
                dependency: dependency.clone(),
            });
        }

        info!(
            engine = %info.name,
            kind = %info.factory.kind(),
            priority = info.priority,
            dependencies = ?info.dependencies,
            "Engine registered"
        );
        if write(&self.instances).remove(&info.name).is_some() {
            debug!(engine = %info.name, "Dropped singleton of replaced engine");
        }
        engines.insert(info.name.clone(), info);
        Ok(())
    }

    /// Remove an engine no other engine depends on.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut engines = write(&self.engines);
        if !engines.contains_key(name) {
            return Err(Error::not_found("engine", name));
        }
        let mut dependents: Vec<&str> = engines
            .values()
            .filter(|e| e.name != name && e.dependencies.iter().any(|d| d == name))
            .map(|e| e.name.as_str())
            .collect();
        if !dependents.is_empty() {
            dependents.sort_unstable();
            return Err(Error::InvalidEngine {
                name: name.to_string(),
                reason: format!("still required by {}", dependents.join(", ")),
            });
        }
        engines.remove(name);
        write(&self.instances).remove(name);
        write(&self.configured).remove(name);
        info!(engine = name, "Engine unregistered");
        Ok(())
    }

    /// Set overrides applied every time `name` is instantiated, including
    /// when it is created as another engine's dependency.
    pub fn configure(&self, name: &str, overrides: Map<String, Value>) {
        write(&self.configured).insert(name.to_string(), overrides);
    }

    /// Return the singleton for `name`, creating it (and its dependencies) if
    /// needed.  Config precedence: schema defaults < `configure` < `overrides`.
    pub fn create(
        &self,
        name: &str,
        overrides: &Map<String, Value>,
        force_recreate: bool,
    ) -> Result<Arc<dyn IsolationEngine>> {
        let mut stack = Vec::new();
        self.create_inner(name, overrides, force_recreate, &mut stack)
    }

    fn create_inner(
        &self,
        name: &str,
        overrides: &Map<String, Value>,
        force_recreate: bool,
        stack: &mut Vec<String>,
    ) -> Result<Arc<dyn IsolationEngine>> {
        if stack.iter().any(|n| n == name) {
            let mut cycle = stack.clone();
            cycle.push(name.to_string());
            return Err(Error::CyclicDependency(cycle));
        }
        let info = read(&self.engines)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("engine", name))?;

        if !force_recreate {
            if let Some(engine) = read(&self.instances).get(name) {
                return Ok(engine.clone());
            }
        }

        stack.push(name.to_string());
        for dependency in &info.dependencies {
            if !self.is_registered(dependency) {
                return Err(Error::UnmetDependency {
                    engine: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
            self.create_inner(dependency, &Map::new(), false, stack)?;
        }
        stack.pop();

        let mut config = info.defaults.clone();
        if let Some(configured) = read(&self.configured).get(name) {
            config.extend(configured.clone());
        }
        config.extend(overrides.clone());

        let engine = info.factory.build(name, &config)?;
        let mut instances = write(&self.instances);
        if !force_recreate {
            // Lost a race with a concurrent create; keep the first singleton.
            if let Some(existing) = instances.get(name) {
                return Ok(existing.clone());
            }
        }
        instances.insert(name.to_string(), engine.clone());
        info!(engine = name, "Engine instantiated");
        Ok(engine)
    }

    /// Topological order of all registered engines.
    pub fn get_load_order(&self) -> Result<Vec<String>> {
        let engines = read(&self.engines);

        let mut in_degree: HashMap<&str, usize> =
            engines.keys().map(|k| (k.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for info in engines.values() {
            for dependency in &info.dependencies {
                if !engines.contains_key(dependency) {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(info.name.as_str()) {
                    *degree += 1;
                }
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(info.name.as_str());
            }
        }

        let mut ready: BinaryHeap<Reverse<(i32, &str)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| Reverse((engines[*name].priority, *name)))
            .collect();

        let mut order = Vec::with_capacity(engines.len());
        while let Some(Reverse((_, name))) = ready.pop() {
            order.push(name.to_string());
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((engines[*dependent].priority, *dependent)));
                    }
                }
            }
        }

        if order.len() < engines.len() {
            let mut stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            stuck.sort();
            warn!(engines = ?stuck, "Engine dependency cycle");
            return Err(Error::CyclicDependency(stuck));
        }
        Ok(order)
    }

    /// Existing singleton, if the engine was created.
    pub fn get(&self, name: &str) -> Option<Arc<dyn IsolationEngine>> {
        read(&self.instances).get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        read(&self.engines).contains_key(name)
    }

    pub fn engine_info(&self, name: &str) -> Option<EngineInfo> {
        read(&self.engines).get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn list_engines(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.engines).keys().cloned().collect();
        names.sort();
        names
    }

    /// `(name, kind, priority)` for every registered engine.
    pub fn registered_kinds(&self) -> Vec<(String, EngineKind, i32)> {
        let mut kinds: Vec<_> = read(&self.engines)
            .values()
            .map(|i| (i.name.clone(), i.factory.kind(), i.priority))
            .collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        kinds
    }

    pub fn instantiated_engines(&self) -> Vec<Arc<dyn IsolationEngine>> {
        let mut engines: Vec<_> = read(&self.instances).values().cloned().collect();
        engines.sort_by(|a, b| a.name().cmp(b.name()));
        engines
    }

    /// Drop every singleton.  Registrations stay.
    pub fn shutdown(&self) {
        let dropped = {
            let mut instances = write(&self.instances);
            let n = instances.len();
            instances.clear();
            n
        };
        info!(engines = dropped, "Engine registry shut down");
    }
}
