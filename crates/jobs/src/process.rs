//! Shared external processes.
//!
//! Several backends can sit on one expensive process (a local inference
//! server, say). Backends link to it by id and raise reload/unload signals;
//! the job loop services those signals between jobs so a process is never
//! restarted under a running job.

use async_trait::async_trait;
use cadenza_core::ProcessError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[async_trait]
pub trait ManagedProcess: Send + Sync {
    fn id(&self) -> &str;

    /// Start the process, or restart it if running.
    async fn reload(&self) -> Result<(), ProcessError>;

    async fn unload(&self) -> Result<(), ProcessError>;

    fn is_running(&self) -> bool;
}

struct Slot {
    process: Arc<dyn ManagedProcess>,
    reload_signal: AtomicBool,
    unload_signal: AtomicBool,
    links: Mutex<HashSet<String>>,
}

#[derive(Default)]
pub struct ProcessManager {
    slots: Mutex<Vec<Arc<Slot>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, id: &str) -> Result<Arc<Slot>, ProcessError> {
        self.slots()
            .iter()
            .find(|s| s.process.id() == id)
            .cloned()
            .ok_or_else(|| ProcessError::Unknown(id.to_string()))
    }

    /// Make a process available for linking. It is not started until the
    /// first link or reload signal.
    pub fn register(&self, process: Arc<dyn ManagedProcess>) {
        let mut slots = self.slots();
        slots.retain(|s| s.process.id() != process.id());
        slots.push(Arc::new(Slot {
            process,
            reload_signal: AtomicBool::new(false),
            unload_signal: AtomicBool::new(false),
            links: Mutex::new(HashSet::new()),
        }));
    }

    /// Record a user of `process_id`, starting it if needed.
    pub async fn link(&self, process_id: &str, link_id: &str) -> Result<(), ProcessError> {
        let slot = self.slot(process_id)?;
        if slot.links.lock().unwrap_or_else(|e| e.into_inner()).contains(link_id) {
            return Err(ProcessError::DuplicateLink {
                process: process_id.into(),
                link: link_id.into(),
            });
        }
        if !slot.process.is_running() {
            slot.process.reload().await?;
        }
        slot.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(link_id.to_string());
        debug!(process = process_id, link = link_id, "Linked process");
        Ok(())
    }

    /// Drop a user. The last one out signals an unload.
    pub fn unlink(&self, process_id: &str, link_id: &str) -> Result<(), ProcessError> {
        let slot = self.slot(process_id)?;
        let mut links = slot.links.lock().unwrap_or_else(|e| e.into_inner());
        if !links.remove(link_id) {
            return Err(ProcessError::MissingLink {
                process: process_id.into(),
                link: link_id.into(),
            });
        }
        if links.is_empty() {
            info!(process = process_id, "No more links to process, unloading");
            slot.unload_signal.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn signal_reload(&self, process_id: &str) -> Result<(), ProcessError> {
        self.slot(process_id)?.reload_signal.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn signal_unload(&self, process_id: &str) -> Result<(), ProcessError> {
        self.slot(process_id)?.unload_signal.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Reload every process with a pending reload signal.
    pub async fn reload(&self) -> Result<(), ProcessError> {
        let pending: Vec<_> = self.slots().clone();
        for slot in pending {
            if slot.reload_signal.swap(false, Ordering::SeqCst) {
                info!(process = slot.process.id(), "Reloading process");
                slot.process.reload().await?;
            }
        }
        Ok(())
    }

    /// Unload every process with a pending unload signal.
    pub async fn unload(&self) -> Result<(), ProcessError> {
        let pending: Vec<_> = self.slots().clone();
        for slot in pending {
            if slot.unload_signal.swap(false, Ordering::SeqCst) {
                let links = slot.links.lock().unwrap_or_else(|e| e.into_inner()).len();
                if links > 0 {
                    warn!(process = slot.process.id(), links, "Unloading process that still has links");
                }
                info!(process = slot.process.id(), "Unloading process");
                slot.process.unload().await?;
            }
        }
        Ok(())
    }

    /// Unload everything still running, returning the first failure.
    pub async fn unload_all(&self) -> Result<(), ProcessError> {
        let all: Vec<_> = self.slots().clone();
        let mut first_error = None;
        for slot in all {
            slot.unload_signal.store(false, Ordering::SeqCst);
            if slot.process.is_running() {
                if let Err(e) = slot.process.unload().await {
                    warn!(process = slot.process.id(), error = %e, "Failed to unload process");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Server {
        running: AtomicBool,
        reloads: AtomicUsize,
        unloads: AtomicUsize,
    }

    #[async_trait]
    impl ManagedProcess for Server {
        fn id(&self) -> &str {
            "llm-server"
        }
        async fn reload(&self) -> Result<(), ProcessError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn unload(&self) -> Result<(), ProcessError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn links_start_once_and_last_unlink_signals_unload() {
        let server = Arc::new(Server::default());
        let manager = ProcessManager::new();
        manager.register(server.clone());

        manager.link("llm-server", "t2t").await.unwrap();
        manager.link("llm-server", "stt").await.unwrap();
        assert_eq!(server.reloads.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.link("llm-server", "t2t").await,
            Err(ProcessError::DuplicateLink { .. })
        ));

        manager.unlink("llm-server", "t2t").unwrap();
        manager.unload().await.unwrap();
        assert_eq!(server.unloads.load(Ordering::SeqCst), 0);

        manager.unlink("llm-server", "stt").unwrap();
        manager.unload().await.unwrap();
        assert_eq!(server.unloads.load(Ordering::SeqCst), 1);
        assert!(manager.unlink("llm-server", "stt").is_err());
    }

    #[tokio::test]
    async fn signals_are_serviced_once() {
        let server = Arc::new(Server::default());
        let manager = ProcessManager::new();
        manager.register(server.clone());

        manager.signal_reload("llm-server").unwrap();
        manager.reload().await.unwrap();
        manager.reload().await.unwrap();
        assert_eq!(server.reloads.load(Ordering::SeqCst), 1);

        assert!(matches!(
            manager.signal_unload("other"),
            Err(ProcessError::Unknown(_))
        ));
        manager.unload_all().await.unwrap();
        assert!(!server.is_running());
    }
}
