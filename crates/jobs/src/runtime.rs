//! The runtime context object.
//!
//! One [`Runtime`] owns the registry, MCP clients, conversation context,
//! event bus and job loop for a process. Nothing is global, so tests build
//! as many independent runtimes as they like.

use cadenza_config::AppConfig;
use cadenza_core::{EventBus, EventHandler, JobError, SubscriptionId};
use cadenza_mcp::{McpManager, RegistrySampler};
use cadenza_operations::{BackendTable, OperationRegistry};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handlers::{self, Services};
use crate::job::{JobArgs, JobId, JobState, JobType};
use crate::process::ProcessManager;
use crate::scheduler::JobScheduler;

pub struct Runtime {
    services: Arc<Services>,
    scheduler: Arc<JobScheduler>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub async fn start(config: AppConfig, table: BackendTable) -> cadenza_core::Result<Self> {
        Self::start_with_processes(config, table, Arc::new(ProcessManager::new())).await
    }

    /// Start with a process manager whose shared processes the table's
    /// backends already link to.
    ///
    /// Every configured operation id is checked against `table` before any
    /// tool server is spawned. A tool server that fails to start is logged
    /// and skipped.
    pub async fn start_with_processes(
        config: AppConfig,
        table: BackendTable,
        processes: Arc<ProcessManager>,
    ) -> cadenza_core::Result<Self> {
        config.validate()?;
        table.validate(config.operations.iter().map(|spec| (spec.role, spec.id.as_str())))?;

        let registry = Arc::new(OperationRegistry::new(Arc::new(table)));
        let sampler = Arc::new(RegistrySampler::new(Arc::clone(&registry)));
        let mcp = Arc::new(McpManager::with_sampler(sampler));
        for server in &config.mcp {
            if let Err(e) = mcp.load_mcp(server).await {
                warn!(server = %server.id, error = %e, "Skipping tool server that failed to start");
            }
        }

        registry.load_operations_from_config(&config.operations).await?;

        let bus = Arc::new(EventBus::new());
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&bus),
            Arc::clone(&processes),
            &config.scheduler,
        ));
        let services = Arc::new(Services::new(config, registry, mcp, processes));

        let shutdown = CancellationToken::new();
        let worker = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };
        info!(
            operations = %services.registry.get_operation_all(),
            tool_servers = services.mcp.server_ids().len(),
            "Runtime started"
        );

        Ok(Self {
            services,
            scheduler,
            bus,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Validate and queue a job. Returns its id at once.
    pub fn create_job(&self, job_type: &str, kwargs: serde_json::Value) -> Result<JobId, JobError> {
        let job_type: JobType = job_type.parse()?;
        let args = JobArgs::parse(job_type, kwargs)?;
        let services = Arc::clone(&self.services);
        Ok(self
            .scheduler
            .submit(job_type, move |scope| handlers::dispatch(services, scope, args)))
    }

    pub fn cancel_job(&self, id: &JobId, reason: Option<&str>) -> Result<(), JobError> {
        self.scheduler.cancel_job(id, reason)
    }

    pub fn job_state(&self, id: &JobId) -> Option<JobState> {
        self.scheduler.job_state(id)
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.bus.subscribe(handler)
    }

    pub fn unsubscribe(&self, handler: &Arc<dyn EventHandler>) {
        self.bus.unsubscribe(handler);
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        self.services.registry()
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        self.services.mcp()
    }

    pub fn config(&self) -> AppConfig {
        self.services.config_snapshot()
    }

    /// Stop the job loop and release everything.
    ///
    /// The running job is cancelled and queued jobs are reported as
    /// cancelled. Every resource is released even if one fails; the first
    /// failure is returned.
    pub async fn stop(&self) -> cadenza_core::Result<()> {
        if let Some(current) = self.scheduler.current_job() {
            // It may finish on its own between the check and the cancel.
            let _ = self.scheduler.cancel_job(&current, Some("runtime stopping"));
        }
        self.shutdown.cancel();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Job loop task ended abnormally");
            }
        }

        let mut first_error: Option<cadenza_core::Error> = None;
        if let Err(e) = self.services.registry.close_operation_all().await {
            warn!(error = %e, "Failed to close operations");
            first_error.get_or_insert(e.into());
        }
        if let Err(e) = self.services.mcp.close().await {
            warn!(error = %e, "Failed to close tool servers");
            first_error.get_or_insert(e.into());
        }
        if let Err(e) = self.services.processes.unload_all().await {
            warn!(error = %e, "Failed to unload processes");
            first_error.get_or_insert(e.into());
        }
        self.bus.close();
        info!("Runtime stopped");
        first_error.map_or(Ok(()), Err)
    }
}
