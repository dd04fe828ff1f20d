//! # Replication Slot Reconciler
//!
//! Idempotently creates or drops physical replication slots.

use std::sync::Arc;

use tracing::info;

use crate::config::{DesiredState, SlotConfig, StrictPolicy};
use crate::error::Result;
use crate::pg::SqlExecutor;

const SLOT_EXISTS: &str = "SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1";

const CREATE_SLOT: &str = "SELECT pg_create_physical_replication_slot($1)";

const DROP_SLOT: &str = "SELECT pg_drop_physical_replication_slot($1)";

/// Converges the declared physical replication slots.
pub struct SlotReconciler {
    exec: Arc<dyn SqlExecutor>,
    strict: StrictPolicy,
    slots: Vec<SlotConfig>,
}

impl std::fmt::Debug for SlotReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReconciler")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl SlotReconciler {
    pub fn new(exec: Arc<dyn SqlExecutor>, strict: StrictPolicy, slots: Vec<SlotConfig>) -> Self {
        Self {
            exec,
            strict,
            slots,
        }
    }

    /// Converge every declared slot.
    pub async fn reconcile(&self) -> Result<()> {
        for slot in &self.slots {
            match slot.state() {
                DesiredState::Present => self.create_slot(slot.name()).await?,
                DesiredState::Absent => self.drop_slot(slot.name()).await?,
            }
        }
        Ok(())
    }

    async fn create_slot(&self, name: &str) -> Result<()> {
        if !self.exec.exists(None, SLOT_EXISTS, &[name]).await? {
            self.exec.execute(None, CREATE_SLOT, &[name]).await?;
            info!(slot = %name, "created replication slot");
        }
        Ok(())
    }

    /// Drop the slot if it exists. Gated by the slots strict flag.
    async fn drop_slot(&self, name: &str) -> Result<()> {
        if !self.strict.slots {
            info!(slot = %name, "not dropping replication slot (strict.slots is not enabled)");
            return Ok(());
        }
        if self.exec.exists(None, SLOT_EXISTS, &[name]).await? {
            self.exec.execute(None, DROP_SLOT, &[name]).await?;
            info!(slot = %name, "dropped replication slot");
        }
        Ok(())
    }
}
