//! Built-in isolation backends
//!
//! Each backend is a thin [`EnvironmentDriver`](crate::executor::EnvironmentDriver)
//! plus a serde config struct whose `Default` doubles as the engine's schema
//! defaults.  [`factory`] maps the closed [`EngineKind`] set onto constructor
//! functions; there is no dynamic lookup.

pub mod basic;
pub mod container;
pub mod virtualenv;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::engine::isolation::{DriverEngine, EngineKind, IsolationEngine};
use crate::engine::registry::{EngineFactory, EngineInfo};
use crate::error::{Error, Result};

pub use basic::{BasicEngineConfig, DirectoryDriver};
pub use container::{ContainerDriver, ContainerEngineConfig};
pub use virtualenv::{VirtualenvDriver, VirtualenvEngineConfig};

/// Name → factory table for the built-in kinds.
pub fn factory(kind: EngineKind) -> EngineFactory {
    match kind {
        EngineKind::Basic => EngineFactory::new(kind, build_basic),
        EngineKind::Virtualenv => EngineFactory::new(kind, build_virtualenv),
        EngineKind::Container => EngineFactory::new(kind, build_container),
    }
}

/// Default engine configuration for `kind`, as a JSON object.
pub fn schema_defaults(kind: EngineKind) -> Map<String, Value> {
    match kind {
        EngineKind::Basic => to_map(&BasicEngineConfig::default()),
        EngineKind::Virtualenv => to_map(&VirtualenvEngineConfig::default()),
        EngineKind::Container => to_map(&ContainerEngineConfig::default()),
    }
}

/// Registry record for a built-in engine under its canonical name.
pub fn builtin_info(kind: EngineKind) -> EngineInfo {
    let info = EngineInfo::new(kind.name(), factory(kind)).defaults(schema_defaults(kind));
    match kind {
        EngineKind::Basic => info.priority(0),
        EngineKind::Virtualenv => info.priority(10).depends_on("basic"),
        EngineKind::Container => info.priority(20),
    }
}

fn to_map<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn parse_config<T: DeserializeOwned>(name: &str, config: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| Error::Configuration(format!("engine '{name}': {e}")))
}

fn build_basic(name: &str, config: &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>> {
    let parsed: BasicEngineConfig = parse_config(name, config)?;
    let driver = Arc::new(DirectoryDriver::new(&parsed));
    Ok(Arc::new(DriverEngine::new(
        name,
        EngineKind::Basic,
        config.clone(),
        parsed.base_dir,
        driver,
    )))
}

fn build_virtualenv(name: &str, config: &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>> {
    let parsed: VirtualenvEngineConfig = parse_config(name, config)?;
    let driver = Arc::new(VirtualenvDriver::new(&parsed));
    Ok(Arc::new(DriverEngine::new(
        name,
        EngineKind::Virtualenv,
        config.clone(),
        parsed.base_dir,
        driver,
    )))
}

fn build_container(name: &str, config: &Map<String, Value>) -> Result<Arc<dyn IsolationEngine>> {
    let parsed: ContainerEngineConfig = parse_config(name, config)?;
    let driver = Arc::new(ContainerDriver::new(&parsed));
    let cli = parsed.cli.clone();
    let engine = DriverEngine::new(
        name,
        EngineKind::Container,
        config.clone(),
        parsed.base_dir,
        driver,
    )
    .with_readiness_check(Arc::new(move || {
        if container::cli_available(&cli) {
            Ok(())
        } else {
            Err(format!("container CLI '{cli}' not found on PATH"))
        }
    }));
    Ok(Arc::new(engine))
}
