//! The operation registry: which backend occupies each pipeline role.
//!
//! Singleton roles hold at most one operation; chain roles hold an ordered
//! list with unique ids. Slot bookkeeping sits behind a short-lived mutex
//! that is never held across an await, so a running operation stream never
//! blocks loads or closes.

use cadenza_config::OperationSpec;
use cadenza_core::{Chunk, ChunkStream, OpConfig, OpRole, Operation, OperationError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::FilterPipeline;
use crate::table::BackendTable;

#[derive(Default)]
struct Slots {
    singletons: HashMap<OpRole, Arc<Operation>>,
    chains: HashMap<OpRole, Vec<Arc<Operation>>>,
}

pub struct OperationRegistry {
    table: Arc<BackendTable>,
    slots: Mutex<Slots>,
}

impl OperationRegistry {
    pub fn new(table: Arc<BackendTable>) -> Self {
        Self {
            table,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn table(&self) -> &Arc<BackendTable> {
        &self.table
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn chain_contains(&self, role: OpRole, id: &str) -> bool {
        self.slots()
            .chains
            .get(&role)
            .is_some_and(|chain| chain.iter().any(|op| op.id() == id))
    }

    /// Resolve a loaded operation by role and optional id.
    ///
    /// Chain roles need an id. A singleton lookup with an id that does not
    /// match the occupant fails the same way as an empty slot.
    pub fn get(&self, role: OpRole, id: Option<&str>) -> Result<Arc<Operation>, OperationError> {
        let slots = self.slots();
        let found = if role.is_chain() {
            id.and_then(|id| {
                slots
                    .chains
                    .get(&role)
                    .and_then(|chain| chain.iter().find(|op| op.id() == id))
            })
        } else {
            slots
                .singletons
                .get(&role)
                .filter(|op| id.is_none_or(|id| op.id() == id))
        };
        found.cloned().ok_or_else(|| OperationError::Unloaded {
            role,
            id: id.map(str::to_string),
        })
    }

    /// Snapshot of a chain role's stages, in order.
    pub fn chain(&self, role: OpRole) -> Vec<Arc<Operation>> {
        self.slots().chains.get(&role).cloned().unwrap_or_default()
    }

    pub fn is_loaded(&self, role: OpRole) -> bool {
        let slots = self.slots();
        if role.is_chain() {
            slots.chains.get(&role).is_some_and(|chain| !chain.is_empty())
        } else {
            slots.singletons.contains_key(&role)
        }
    }

    /// Construct, configure and start a standalone operation.
    ///
    /// It is not installed; the caller owns closing it.
    pub async fn build_loose(
        &self,
        role: OpRole,
        id: &str,
        config: &OpConfig,
    ) -> Result<Arc<Operation>, OperationError> {
        let op = Arc::new(self.table.build(role.kind(), id)?);
        op.configure(config).await?;
        op.start().await?;
        Ok(op)
    }

    /// Put a singleton back after its replacement failed. A slot filled
    /// by a concurrent load in the meantime wins.
    async fn restore(&self, role: OpRole, previous: Arc<Operation>) {
        if !previous.is_active() {
            if let Err(e) = previous.start().await {
                warn!(role = %role, id = %previous.id(), error = %e, "Failed to restart previous operation");
                return;
            }
        }
        let occupied = {
            let mut slots = self.slots();
            if slots.singletons.contains_key(&role) {
                true
            } else {
                slots.singletons.insert(role, Arc::clone(&previous));
                false
            }
        };
        if occupied {
            if let Err(e) = previous.close().await {
                warn!(role = %role, id = %previous.id(), error = %e, "Failed to close previous operation");
            }
        } else {
            info!(role = %role, id = %previous.id(), "Restored previous operation");
        }
    }

    /// Load a backend into a role.
    ///
    /// Chain roles reject an id already present. Singleton roles close the
    /// previous occupant once the new backend has accepted its
    /// configuration and before it starts. If the new backend fails to
    /// start, the previous occupant is restarted and put back.
    pub async fn load_operation(
        &self,
        role: OpRole,
        id: &str,
        config: &OpConfig,
    ) -> Result<(), OperationError> {
        if role.is_chain() && self.chain_contains(role, id) {
            return Err(OperationError::Duplicate {
                role,
                id: id.to_string(),
            });
        }

        let op = Arc::new(self.table.build(role.kind(), id)?);
        op.configure(config).await?;

        let previous = if role.is_chain() {
            None
        } else {
            self.slots().singletons.remove(&role)
        };
        if let Some(previous) = &previous {
            info!(role = %role, old = %previous.id(), new = %id, "Replacing operation");
            if let Err(e) = previous.close().await {
                self.restore(role, Arc::clone(previous)).await;
                return Err(e);
            }
        }

        if let Err(e) = op.start().await {
            if let Some(previous) = previous {
                self.restore(role, previous).await;
            }
            return Err(e);
        }

        // A concurrent load may have filled the slot while this one started.
        let (duplicate, displaced) = {
            let mut slots = self.slots();
            if role.is_chain() {
                let chain = slots.chains.entry(role).or_default();
                if chain.iter().any(|existing| existing.id() == id) {
                    (true, None)
                } else {
                    chain.push(Arc::clone(&op));
                    (false, None)
                }
            } else {
                (false, slots.singletons.insert(role, Arc::clone(&op)))
            }
        };

        if duplicate {
            if let Err(e) = op.close().await {
                warn!(role = %role, id = %id, error = %e, "Failed to close duplicate operation");
            }
            return Err(OperationError::Duplicate {
                role,
                id: id.to_string(),
            });
        }
        if let Some(displaced) = displaced {
            if let Err(e) = displaced.close().await {
                warn!(role = %role, id = %displaced.id(), error = %e, "Failed to close displaced operation");
            }
        }
        info!(role = %role, id = %id, "Loaded operation");
        Ok(())
    }

    /// Close and remove a loaded operation.
    pub async fn close_operation(&self, role: OpRole, id: Option<&str>) -> Result<(), OperationError> {
        let removed = {
            let mut slots = self.slots();
            if role.is_chain() {
                let chain = slots.chains.entry(role).or_default();
                id.and_then(|id| chain.iter().position(|op| op.id() == id))
                    .map(|idx| chain.remove(idx))
            } else {
                let matches = slots
                    .singletons
                    .get(&role)
                    .is_some_and(|op| id.is_none_or(|id| op.id() == id));
                if matches { slots.singletons.remove(&role) } else { None }
            }
        };

        let op = removed.ok_or_else(|| OperationError::Unloaded {
            role,
            id: id.map(str::to_string),
        })?;
        op.close().await?;
        info!(role = %role, id = %op.id(), "Unloaded operation");
        Ok(())
    }

    /// Close every loaded operation, singletons and chains.
    ///
    /// Every slot is cleared even if a close fails; the first failure is
    /// returned afterwards.
    pub async fn close_operation_all(&self) -> Result<(), OperationError> {
        let drained: Vec<(OpRole, Arc<Operation>)> = {
            let mut slots = self.slots();
            let mut drained: Vec<(OpRole, Arc<Operation>)> = Vec::new();
            for role in OpRole::ALL {
                if let Some(op) = slots.singletons.remove(&role) {
                    drained.push((role, op));
                }
                if let Some(chain) = slots.chains.remove(&role) {
                    drained.extend(chain.into_iter().map(|op| (role, op)));
                }
            }
            drained
        };

        let mut first_error = None;
        for (role, op) in drained {
            if let Err(e) = op.close().await {
                warn!(role = %role, id = %op.id(), error = %e, "Failed to close operation");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Replace everything loaded with a declarative list.
    ///
    /// Ids are validated against the backend table before anything is
    /// closed. After that the load is best effort: entries load in order and
    /// the first failure stops the rest, leaving earlier entries loaded.
    pub async fn load_operations_from_config(
        &self,
        specs: &[OperationSpec],
    ) -> Result<(), OperationError> {
        self.table
            .validate(specs.iter().map(|spec| (spec.role, spec.id.as_str())))?;

        self.close_operation_all().await?;
        for spec in specs {
            self.load_operation(spec.role, &spec.id, &spec.config).await?;
        }
        info!(count = specs.len(), "Loaded operations from config");
        Ok(())
    }

    pub async fn configure(
        &self,
        role: OpRole,
        config: &OpConfig,
        id: Option<&str>,
    ) -> Result<(), OperationError> {
        self.get(role, id)?.configure(config).await
    }

    pub async fn get_configuration(
        &self,
        role: OpRole,
        id: Option<&str>,
    ) -> Result<OpConfig, OperationError> {
        Ok(self.get(role, id)?.configuration().await)
    }

    /// Invoke a role on one chunk.
    ///
    /// Resolution errors are returned immediately. A chain role without an
    /// id runs the whole chain as a [`FilterPipeline`].
    pub fn use_operation(
        &self,
        role: OpRole,
        chunk: Chunk,
        id: Option<&str>,
    ) -> Result<ChunkStream, OperationError> {
        if role.is_chain() && id.is_none() {
            return Ok(FilterPipeline::new(self.chain(role)).run(chunk));
        }
        Ok(self.get(role, id)?.invoke(chunk))
    }

    /// Like [`use_operation`](Self::use_operation), stopping a chain early on cancellation.
    pub fn use_operation_cancellable(
        &self,
        role: OpRole,
        chunk: Chunk,
        id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, OperationError> {
        if role.is_chain() && id.is_none() {
            return Ok(FilterPipeline::new(self.chain(role))
                .with_cancellation(cancel.clone())
                .run(chunk));
        }
        Ok(self.get(role, id)?.invoke(chunk))
    }

    /// Loaded ids per role: a string or null for singletons, a list for chains.
    pub fn get_operation_all(&self) -> serde_json::Value {
        let slots = self.slots();
        let mut summary = serde_json::Map::new();
        for role in OpRole::ALL {
            let value = if role.is_chain() {
                serde_json::Value::from(
                    slots
                        .chains
                        .get(&role)
                        .map(|chain| chain.iter().map(|op| op.id().to_string()).collect())
                        .unwrap_or_else(Vec::<String>::new),
                )
            } else {
                slots
                    .singletons
                    .get(&role)
                    .map_or(serde_json::Value::Null, |op| op.id().into())
            };
            summary.insert(role.to_string(), value);
        }
        serde_json::Value::Object(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadenza_core::operation::{from_chunks, once};
    use cadenza_core::{Backend, OpKind};
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        closes: AtomicUsize,
    }

    /// A T2T backend that counts lifecycle calls and echoes a configured reply.
    struct Scripted {
        counters: Arc<Counters>,
        reply: Mutex<String>,
        fail_start: bool,
    }

    #[async_trait]
    impl Backend for Scripted {
        async fn configure(&self, config: &OpConfig) -> Result<(), OperationError> {
            if let Some(reply) = config.get("reply") {
                let reply = reply.as_str().ok_or_else(|| OperationError::InvalidConfig {
                    kind: OpKind::T2t,
                    id: "scripted".into(),
                    reason: "reply must be text".into(),
                })?;
                *self.reply.lock().unwrap() = reply.to_string();
            }
            Ok(())
        }

        async fn configuration(&self) -> OpConfig {
            let mut map = OpConfig::new();
            map.insert("reply".into(), self.reply.lock().unwrap().clone().into());
            map
        }

        async fn start(&self) -> Result<(), OperationError> {
            if self.fail_start {
                return Err(OperationError::Backend {
                    kind: OpKind::T2t,
                    id: "broken".into(),
                    reason: "no model".into(),
                });
            }
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), OperationError> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn generate(&self, _input: Chunk) -> ChunkStream {
            once(Chunk::new().with("content", self.reply.lock().unwrap().clone()))
        }
    }

    struct Splitter;

    #[async_trait]
    impl Backend for Splitter {
        async fn configure(&self, _: &OpConfig) -> Result<(), OperationError> {
            Ok(())
        }
        async fn configuration(&self) -> OpConfig {
            OpConfig::new()
        }
        fn generate(&self, input: Chunk) -> ChunkStream {
            let content = input.text("content").unwrap_or_default().to_string();
            from_chunks(
                content
                    .split(". ")
                    .map(|s| Chunk::new().with("content", s))
                    .collect(),
            )
        }
    }

    struct Upper;

    #[async_trait]
    impl Backend for Upper {
        async fn configure(&self, _: &OpConfig) -> Result<(), OperationError> {
            Ok(())
        }
        async fn configuration(&self) -> OpConfig {
            OpConfig::new()
        }
        fn generate(&self, input: Chunk) -> ChunkStream {
            let content = input.text("content").unwrap_or_default().to_uppercase();
            once(Chunk::new().with("content", content))
        }
    }

    fn registry() -> (OperationRegistry, Arc<Counters>, Arc<Counters>) {
        let first = Arc::new(Counters::default());
        let second = Arc::new(Counters::default());
        let mut table = BackendTable::new();
        let c = first.clone();
        table.register(OpKind::T2t, "first", move || {
            Arc::new(Scripted {
                counters: c.clone(),
                reply: Mutex::new("one".into()),
                fail_start: false,
            })
        });
        let c = second.clone();
        table.register(OpKind::T2t, "second", move || {
            Arc::new(Scripted {
                counters: c.clone(),
                reply: Mutex::new("two".into()),
                fail_start: false,
            })
        });
        table.register(OpKind::T2t, "broken", || {
            Arc::new(Scripted {
                counters: Arc::new(Counters::default()),
                reply: Mutex::new(String::new()),
                fail_start: true,
            })
        });
        table.register(OpKind::FilterText, "split", || Arc::new(Splitter));
        table.register(OpKind::FilterText, "upper", || Arc::new(Upper));
        (OperationRegistry::new(Arc::new(table)), first, second)
    }

    fn messages_chunk() -> Chunk {
        Chunk::new()
            .with("instruction_prompt", "be nice")
            .with("messages", serde_json::json!([]))
    }

    #[tokio::test]
    async fn singleton_replacement_closes_previous_exactly_once() {
        let (reg, first, second) = registry();
        reg.load_operation(OpRole::T2t, "first", &OpConfig::new()).await.unwrap();
        reg.load_operation(OpRole::T2t, "second", &OpConfig::new()).await.unwrap();

        assert_eq!(first.starts.load(Ordering::SeqCst), 1);
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(second.starts.load(Ordering::SeqCst), 1);
        assert_eq!(second.closes.load(Ordering::SeqCst), 0);
        assert_eq!(reg.get(OpRole::T2t, None).unwrap().id(), "second");
    }

    #[tokio::test]
    async fn duplicate_chain_id_leaves_chain_unchanged() {
        let (reg, _, _) = registry();
        reg.load_operation(OpRole::FilterText, "split", &OpConfig::new()).await.unwrap();
        reg.load_operation(OpRole::FilterText, "upper", &OpConfig::new()).await.unwrap();

        let err = reg
            .load_operation(OpRole::FilterText, "split", &OpConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Duplicate { .. }));
        let ids: Vec<String> = reg
            .chain(OpRole::FilterText)
            .iter()
            .map(|op| op.id().to_string())
            .collect();
        assert_eq!(ids, vec!["split", "upper"]);
    }

    #[tokio::test]
    async fn failed_start_installs_nothing() {
        let (reg, _, _) = registry();
        assert!(reg.load_operation(OpRole::T2t, "broken", &OpConfig::new()).await.is_err());
        assert!(!reg.is_loaded(OpRole::T2t));
    }

    #[tokio::test]
    async fn failed_replacement_keeps_the_previous_occupant() {
        let (reg, first, _) = registry();
        reg.load_operation(OpRole::T2t, "first", &OpConfig::new()).await.unwrap();
        assert!(reg.load_operation(OpRole::T2t, "broken", &OpConfig::new()).await.is_err());

        assert_eq!(reg.get(OpRole::T2t, None).unwrap().id(), "first");
        assert!(reg.get(OpRole::T2t, None).unwrap().is_active());
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(first.starts.load(Ordering::SeqCst), 2);
        assert_eq!(reg.get_operation_all()["t2t"], "first");

        let out: Vec<Chunk> = reg
            .use_operation(OpRole::T2t, messages_chunk(), None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out[0].text("content"), Some("one"));
    }

    #[tokio::test]
    async fn use_unloaded_role_fails_synchronously() {
        let (reg, _, _) = registry();
        let err = reg.use_operation(OpRole::Tts, Chunk::new(), None).err().unwrap();
        assert_eq!(err.to_string(), "No operation of type tts loaded");
    }

    #[tokio::test]
    async fn singleton_id_mismatch_is_unloaded() {
        let (reg, _, _) = registry();
        reg.load_operation(OpRole::T2t, "first", &OpConfig::new()).await.unwrap();
        let err = reg.get(OpRole::T2t, Some("second")).unwrap_err();
        assert!(matches!(err, OperationError::Unloaded { id: Some(_), .. }));
    }

    #[tokio::test]
    async fn chain_composes_split_then_upper() {
        let (reg, _, _) = registry();
        reg.load_operation(OpRole::FilterText, "split", &OpConfig::new()).await.unwrap();
        reg.load_operation(OpRole::FilterText, "upper", &OpConfig::new()).await.unwrap();

        let out: Vec<Chunk> = reg
            .use_operation(OpRole::FilterText, Chunk::new().with("content", "hi there. bye now"), None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let contents: Vec<&str> = out.iter().filter_map(|c| c.text("content")).collect();
        assert_eq!(contents, vec!["HI THERE", "BYE NOW"]);

        // a single named stage bypasses the rest of the chain
        let out: Vec<Chunk> = reg
            .use_operation(OpRole::FilterText, Chunk::new().with("content", "a. b"), Some("split"))
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn configure_then_get_configuration_agrees() {
        let (reg, _, _) = registry();
        reg.load_operation(OpRole::Mcp, "first", &OpConfig::new()).await.unwrap();

        let mut update = OpConfig::new();
        update.insert("reply".into(), "<no-tool>".into());
        reg.configure(OpRole::Mcp, &update, None).await.unwrap();

        let current = reg.get_configuration(OpRole::Mcp, None).await.unwrap();
        for (key, value) in &update {
            assert_eq!(current.get(key), Some(value));
        }

        let out: Vec<Chunk> = reg
            .use_operation(OpRole::Mcp, messages_chunk(), None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out[0].text("content"), Some("<no-tool>"));
    }

    #[tokio::test]
    async fn close_operation_all_clears_every_slot() {
        let (reg, first, _) = registry();
        reg.load_operation(OpRole::T2t, "first", &OpConfig::new()).await.unwrap();
        reg.load_operation(OpRole::FilterText, "split", &OpConfig::new()).await.unwrap();

        reg.close_operation_all().await.unwrap();
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        let summary = reg.get_operation_all();
        assert!(summary["t2t"].is_null());
        assert_eq!(summary["filter_text"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn close_missing_chain_member_is_unloaded() {
        let (reg, _, _) = registry();
        let err = reg
            .close_operation(OpRole::FilterText, Some("split"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "operation_unloaded");
    }

    #[tokio::test]
    async fn config_load_validates_ids_before_closing() {
        let (reg, first, _) = registry();
        reg.load_operation(OpRole::T2t, "first", &OpConfig::new()).await.unwrap();

        let specs = vec![OperationSpec {
            role: OpRole::Tts,
            id: "nope".into(),
            config: OpConfig::new(),
        }];
        let err = reg.load_operations_from_config(&specs).await.unwrap_err();
        assert!(matches!(err, OperationError::UnknownId { .. }));
        assert_eq!(first.closes.load(Ordering::SeqCst), 0);
        assert!(reg.is_loaded(OpRole::T2t));
    }

    #[tokio::test]
    async fn config_load_is_best_effort() {
        let (reg, first, _) = registry();
        reg.load_operation(OpRole::T2t, "first", &OpConfig::new()).await.unwrap();

        let specs = vec![
            OperationSpec {
                role: OpRole::FilterText,
                id: "split".into(),
                config: OpConfig::new(),
            },
            OperationSpec {
                role: OpRole::Mcp,
                id: "broken".into(),
                config: OpConfig::new(),
            },
            OperationSpec {
                role: OpRole::FilterText,
                id: "upper".into(),
                config: OpConfig::new(),
            },
        ];
        assert!(reg.load_operations_from_config(&specs).await.is_err());
        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(reg.get_operation_all()["filter_text"], serde_json::json!(["split"]));
        assert!(!reg.is_loaded(OpRole::Mcp));
    }
}
