//! Registration table mapping `(kind, backend id)` to a constructor.
//!
//! The table is built once at startup. Every id named in configuration is
//! checked against it before anything is loaded, so a typo fails at boot
//! rather than at first use.

use cadenza_core::{Backend, OpKind, OpRole, Operation, OperationError};
use std::collections::HashMap;
use std::sync::Arc;

use crate::backends;

type Factory = Arc<dyn Fn() -> Arc<dyn Backend> + Send + Sync>;

/// Constructors for every backend this process can load.
#[derive(Clone, Default)]
pub struct BackendTable {
    factories: HashMap<(OpKind, String), Factory>,
}

impl BackendTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with every built-in backend registered.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register(OpKind::FilterText, "chunker_sentence", || {
            Arc::new(backends::SentenceChunker::new())
        });
        table.register(OpKind::FilterText, "filter_clean", || {
            Arc::new(backends::ResponseCleaner::new())
        });
        table.register(OpKind::FilterAudio, "pitch", || Arc::new(backends::PitchShift::new()));
        table.register(OpKind::T2t, "openai", || Arc::new(backends::OpenAiChat::new()));
        table.register(OpKind::Embedding, "openai", || {
            Arc::new(backends::OpenAiEmbedding::new())
        });
        table
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, kind: OpKind, id: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Backend> + Send + Sync + 'static,
    {
        self.factories.insert((kind, id.into()), Arc::new(factory));
    }

    pub fn contains(&self, kind: OpKind, id: &str) -> bool {
        self.factories.contains_key(&(kind, id.to_string()))
    }

    /// Registered ids for one kind, sorted.
    pub fn ids(&self, kind: OpKind) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .factories
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Construct a fresh, inactive operation that is not installed anywhere.
    ///
    /// Starting, using and closing it is up to the caller.
    pub fn build(&self, kind: OpKind, id: &str) -> Result<Operation, OperationError> {
        let factory = self
            .factories
            .get(&(kind, id.to_string()))
            .ok_or_else(|| OperationError::UnknownId {
                kind,
                id: id.to_string(),
            })?;
        Ok(Operation::new(kind, id, factory()))
    }

    /// Check that every `(role, id)` pair resolves to a registered backend.
    pub fn validate<'a, I>(&self, entries: I) -> Result<(), OperationError>
    where
        I: IntoIterator<Item = (OpRole, &'a str)>,
    {
        for (role, id) in entries {
            if !self.contains(role.kind(), id) {
                return Err(OperationError::UnknownId {
                    kind: role.kind(),
                    id: id.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BackendTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .factories
            .keys()
            .map(|(kind, id)| format!("{kind}/{id}"))
            .collect();
        keys.sort();
        f.debug_struct("BackendTable").field("backends", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let table = BackendTable::with_builtins();
        assert_eq!(table.ids(OpKind::FilterText), vec!["chunker_sentence", "filter_clean"]);
        assert!(table.contains(OpKind::T2t, "openai"));
        assert!(table.contains(OpKind::Embedding, "openai"));
        assert!(!table.contains(OpKind::Tts, "openai"));
    }

    #[test]
    fn build_unknown_id_fails() {
        let table = BackendTable::with_builtins();
        let err = table.build(OpKind::Tts, "azure").unwrap_err();
        assert!(matches!(err, OperationError::UnknownId { kind: OpKind::Tts, .. }));
    }

    #[test]
    fn build_returns_inactive_operation() {
        let table = BackendTable::with_builtins();
        let op = table.build(OpKind::FilterText, "filter_clean").unwrap();
        assert_eq!(op.id(), "filter_clean");
        assert!(!op.is_active());
    }

    #[test]
    fn validate_maps_roles_to_kinds() {
        let table = BackendTable::with_builtins();
        assert!(table.validate([(OpRole::Mcp, "openai"), (OpRole::FilterAudio, "pitch")]).is_ok());
        let err = table
            .validate([(OpRole::T2t, "openai"), (OpRole::Stt, "fish")])
            .unwrap_err();
        assert_eq!(err.kind(), "operation_unknown_id");
    }
}
