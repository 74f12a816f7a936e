//! Built-in connectors
//!
//! | Kind        | Source | Sink | Mode    |
//! |-------------|--------|------|---------|
//! | `memory`    | yes    | yes  | direct  |
//! | `datagen`   | yes    |      |         |
//! | `log`       |        | yes  | direct  |
//! | `file`      | yes    | yes  | direct  |
//! | `warehouse` |        | yes  | staging |
//! | `redshift`  |        | yes  | staging |
//! | `mysql`     | yes    |      |         |
//!
//! `redshift` and `mysql` are behind the cargo features of the same name.

pub mod datagen;
pub mod file;
pub mod log;
pub mod memory;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "redshift")]
pub mod redshift;
pub mod staging;

use crate::traits::ConnectorRegistry;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// Behaviour when a sink's target already holds data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveMode {
    #[default]
    Append,
    Overwrite,
    ErrorIfExists,
    Ignore,
}

impl SaveMode {
    pub const CHOICES: &'static [&'static str] = &["append", "overwrite", "errorIfExists", "ignore"];
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaveMode::Append => "append",
            SaveMode::Overwrite => "overwrite",
            SaveMode::ErrorIfExists => "errorIfExists",
            SaveMode::Ignore => "ignore",
        };
        f.write_str(name)
    }
}

/// Registry with every built-in connector, backed by the global memory store
pub fn create_registry() -> ConnectorRegistry {
    let store = memory::MemoryStore::global();
    let mut registry = ConnectorRegistry::new();

    registry.register_source("memory", Arc::new(memory::MemorySourceFactory::new(store.clone())));
    registry.register_source("datagen", Arc::new(datagen::DatagenSourceFactory));
    registry.register_source("file", Arc::new(file::FileSourceFactory));
    #[cfg(feature = "mysql")]
    registry.register_source("mysql", Arc::new(mysql::MysqlSourceFactory));

    registry.register_sink("memory", Arc::new(memory::MemorySinkFactory::new(store.clone())));
    registry.register_sink("log", Arc::new(log::LogSinkFactory));
    registry.register_sink("file", Arc::new(file::FileSinkFactory));
    registry.register_sink("warehouse", Arc::new(staging::WarehouseSinkFactory::new(store)));
    #[cfg(feature = "redshift")]
    registry.register_sink("redshift", Arc::new(redshift::RedshiftSinkFactory));

    registry
}
