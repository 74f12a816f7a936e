//! Connector registry
//!
//! Maps connector-kind names to factories. A registry is populated once at
//! startup and then shared read-only (`Arc<ConnectorRegistry>`) by every job,
//! so resolution needs no locking.
//!
//! # Example
//!
//! ```rust
//! use datatunnel::connectors::memory::{MemorySinkFactory, MemorySourceFactory, MemoryStore};
//! use datatunnel::ConnectorRegistry;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let mut registry = ConnectorRegistry::new();
//! registry.register_source("memory", Arc::new(MemorySourceFactory::new(store.clone())));
//! registry.register_sink("memory", Arc::new(MemorySinkFactory::new(store)));
//! assert!(registry.contains_sink("memory"));
//! ```

use super::sink::Sink;
use super::source::Source;
use crate::error::{OptionsError, TunnelError};
use crate::options::{OptionSchema, OptionsBag, RawOptions, UnknownOptionPolicy};
use crate::statement::{ConnectorRole, TunnelJobPlan};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Creates source instances of one connector kind
pub trait SourceFactory: Send + Sync {
    /// Option contract for this kind
    fn schema(&self) -> OptionSchema;

    /// Build an unopened source from validated options
    fn create(&self, options: OptionsBag) -> Result<Box<dyn Source>, OptionsError>;
}

/// Creates sink instances of one connector kind
pub trait SinkFactory: Send + Sync {
    fn schema(&self) -> OptionSchema;

    fn create(&self, options: OptionsBag) -> Result<Box<dyn Sink>, OptionsError>;
}

struct Registered<F: ?Sized> {
    factory: Arc<F>,
    schema: OptionSchema,
}

/// Registry of source and sink factories keyed by kind
pub struct ConnectorRegistry {
    sources: HashMap<String, Registered<dyn SourceFactory>>,
    sinks: HashMap<String, Registered<dyn SinkFactory>>,
    unknown_options: UnknownOptionPolicy,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            sinks: HashMap::new(),
            unknown_options: UnknownOptionPolicy::default(),
        }
    }

    pub fn with_unknown_option_policy(mut self, policy: UnknownOptionPolicy) -> Self {
        self.unknown_options = policy;
        self
    }

    pub fn unknown_option_policy(&self) -> UnknownOptionPolicy {
        self.unknown_options
    }

    /// Register a source factory. An existing kind is overwritten with a warning.
    pub fn register_source(&mut self, kind: impl Into<String>, factory: Arc<dyn SourceFactory>) {
        let kind = kind.into();
        let schema = factory.schema();
        if self
            .sources
            .insert(kind.clone(), Registered { factory, schema })
            .is_some()
        {
            warn!(kind = %kind, "Source connector kind re-registered; previous factory replaced");
        } else {
            debug!(kind = %kind, "Registered source connector");
        }
    }

    /// Register a sink factory. An existing kind is overwritten with a warning.
    pub fn register_sink(&mut self, kind: impl Into<String>, factory: Arc<dyn SinkFactory>) {
        let kind = kind.into();
        let schema = factory.schema();
        if self
            .sinks
            .insert(kind.clone(), Registered { factory, schema })
            .is_some()
        {
            warn!(kind = %kind, "Sink connector kind re-registered; previous factory replaced");
        } else {
            debug!(kind = %kind, "Registered sink connector");
        }
    }

    pub fn contains_source(&self, kind: &str) -> bool {
        self.sources.contains_key(kind)
    }

    pub fn contains_sink(&self, kind: &str) -> bool {
        self.sinks.contains_key(kind)
    }

    /// Registered source kinds, sorted
    pub fn list_sources(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Registered sink kinds, sorted
    pub fn list_sinks(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.sinks.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn source_schema(&self, kind: &str) -> Option<&OptionSchema> {
        self.sources.get(kind).map(|r| &r.schema)
    }

    pub fn sink_schema(&self, kind: &str) -> Option<&OptionSchema> {
        self.sinks.get(kind).map(|r| &r.schema)
    }

    /// Schema for either side of a tunnel
    pub fn schema(&self, role: ConnectorRole, kind: &str) -> Option<&OptionSchema> {
        match role {
            ConnectorRole::Source => self.source_schema(kind),
            ConnectorRole::Sink => self.sink_schema(kind),
        }
    }

    /// Copy of `plan` with values of sensitive options replaced. Kinds the
    /// registry does not know keep their options as written.
    pub fn redact_plan(&self, plan: &TunnelJobPlan) -> TunnelJobPlan {
        plan.map_options(|spec| match self.schema(spec.role(), spec.kind()) {
            Some(schema) => schema.redact(spec.options()),
            None => spec.options().clone(),
        })
    }

    /// Look up `kind`, validate `options` and build an unopened source.
    pub fn resolve_source(
        &self,
        kind: &str,
        options: &RawOptions,
    ) -> Result<Box<dyn Source>, TunnelError> {
        let entry = self
            .sources
            .get(kind)
            .ok_or_else(|| TunnelError::unknown_kind(ConnectorRole::Source, kind))?;
        let bag = entry.schema.parse(options, self.unknown_options)?;
        Ok(entry.factory.create(bag)?)
    }

    /// Look up `kind`, validate `options` and build an unopened sink.
    pub fn resolve_sink(
        &self,
        kind: &str,
        options: &RawOptions,
    ) -> Result<Box<dyn Sink>, TunnelError> {
        let entry = self
            .sinks
            .get(kind)
            .ok_or_else(|| TunnelError::unknown_kind(ConnectorRole::Sink, kind))?;
        let bag = entry.schema.parse(options, self.unknown_options)?;
        Ok(entry.factory.create(bag)?)
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<ConnectorRegistry>> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn install_global(registry: ConnectorRegistry) -> Result<Arc<ConnectorRegistry>, TunnelError> {
    let registry = Arc::new(registry);
    GLOBAL_REGISTRY
        .set(registry.clone())
        .map_err(|_| TunnelError::Config("connector registry already installed".to_string()))?;
    Ok(registry)
}

/// The process-wide registry; the built-in connector set unless one was installed.
pub fn global() -> Arc<ConnectorRegistry> {
    GLOBAL_REGISTRY
        .get_or_init(|| Arc::new(crate::connectors::create_registry()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::options::{OptionType, OptionValue};
    use crate::traits::testing::{MockSinkFactory, MockSourceFactory, MockState};

    fn registry() -> (ConnectorRegistry, MockState) {
        let state = MockState::default();
        let mut registry = ConnectorRegistry::new();
        registry.register_source("mock", Arc::new(MockSourceFactory::new(state.clone())));
        registry.register_sink("mock", Arc::new(MockSinkFactory::new(state.clone())));
        (registry, state)
    }

    #[test]
    fn test_unknown_kind() {
        let (registry, state) = registry();
        let err = registry
            .resolve_sink("bogus", &RawOptions::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownConnectorKind);
        assert!(err.to_string().contains("'bogus'"));
        assert_eq!(state.source_opens(), 0);
    }

    #[test]
    fn test_resolve_validates_options() {
        let (registry, _) = registry();
        let mut options = RawOptions::new();
        options.insert("nope".into(), OptionValue::Integer(1));
        let err = registry.resolve_source("mock", &options).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Options);

        assert!(registry.resolve_source("mock", &RawOptions::new()).is_ok());
    }

    #[test]
    fn test_reregistration_overwrites() {
        struct Strict;
        impl SourceFactory for Strict {
            fn schema(&self) -> OptionSchema {
                OptionSchema::new("mock").required("must", OptionType::String, "required")
            }
            fn create(&self, _options: OptionsBag) -> Result<Box<dyn Source>, OptionsError> {
                unreachable!("never resolved with valid options in this test")
            }
        }

        let (mut registry, _) = registry();
        registry.register_source("mock", Arc::new(Strict));
        assert_eq!(registry.list_sources(), vec!["mock"]);
        let err = registry
            .resolve_source("mock", &RawOptions::new())
            .err()
            .unwrap();
        assert!(err.to_string().contains("'must'"));
    }

    #[test]
    fn test_unknown_option_policy_warn() {
        let (registry, _) = registry();
        let registry = registry.with_unknown_option_policy(UnknownOptionPolicy::Warn);
        let mut options = RawOptions::new();
        options.insert("nope".into(), OptionValue::Integer(1));
        assert!(registry.resolve_source("mock", &options).is_ok());
    }

    #[test]
    #[cfg(feature = "redshift")]
    fn test_redact_plan() {
        let plan = crate::statement::parse(
            r#"DATATUNNEL SOURCE("datagen") OPTIONS(rowCount=1) SINK("redshift") OPTIONS(password="hunter2", host="h")"#,
        )
        .unwrap();
        let redacted = global().redact_plan(&plan);
        let text = redacted.to_string();
        assert!(!text.contains("hunter2"), "{text}");
        assert!(text.contains("host=\"h\""), "{text}");
        assert_eq!(redacted.source(), plan.source());
    }

    #[test]
    fn test_global_registry_has_builtins() {
        let registry = global();
        assert!(registry.contains_source("memory"));
        assert!(registry.contains_sink("memory"));
        assert!(registry.contains_sink("log"));
    }
}
