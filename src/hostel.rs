use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::payment::PaymentInitiator;

/// Manages per-hostel engines. Each hostel gets its own engine, journal
/// file, and compactor task; nothing is shared between hostels.
pub struct HostelDirectory {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    payments: Arc<dyn PaymentInitiator>,
}

impl HostelDirectory {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        payments: Arc<dyn PaymentInitiator>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            payments,
        }
    }

    /// Get or lazily create an engine for the given hostel.
    pub fn get_or_create(&self, hostel: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(hostel) {
            return Ok(engine.value().clone());
        }
        if hostel.len() > MAX_HOSTEL_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "hostel name too long",
            ));
        }
        if self.engines.len() >= MAX_HOSTELS {
            return Err(std::io::Error::other("too many hostels"));
        }

        // Sanitize hostel name to prevent path traversal
        let safe_name: String = hostel
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty hostel name",
            ));
        }

        let journal_path = self.data_dir.join(format!("{safe_name}.journal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(journal_path, notify, self.payments.clone())?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(hostel.to_string(), engine.clone());
        metrics::gauge!(crate::observability::HOSTELS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
