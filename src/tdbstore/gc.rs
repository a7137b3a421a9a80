//! Two-pass garbage collection and atomic area flip (§4.4).
//!
//! Generalizes `flash_array.rs`'s `reserve`/rollback-on-overflow pattern: instead of simply
//! refusing an allocation that would overflow, GC compacts the live records of the active area
//! forward into the standby area before the swap.

use log::debug;

use crate::block_device::BlockDevice;
use crate::error::Result;
use crate::kv::internal::InternalFlags;

use super::master::MasterRecord;
use super::{Inner, RecordView};

impl<D: BlockDevice> Inner<D> {
    /// Runs GC: pass 1 copies `UPDATE_BACKUP`-flagged records (factory-reset survivors), pass 2
    /// copies the remaining live records unless `factory_reset` is set, in which case pass 2 is
    /// skipped entirely, restoring the device to its backed-up image.
    pub(crate) fn run_gc(&mut self, factory_reset: bool) -> Result<()> {
        let from = self.active;
        let to = self.layout.other(from);
        debug!("tdbstore: GC area {from} -> {to} (factory_reset={factory_reset})");

        let next_master = self.master.next();
        self.erase_area(to)?;
        let mut write_offset = self.write_master(to, next_master)?;

        let live: Vec<RecordView> = self.collect_live_records(from)?;

        let mut new_index = super::index::RamIndex::new();

        let is_backup = |r: &&RecordView| {
            r.user_flags.contains(crate::kv::Flags::UPDATE_BACKUP)
                || r.internal_flags.contains(InternalFlags::IS_BACKUP)
        };

        // Pass 1: backup-flagged records always survive, even under factory reset.
        for record in live.iter().filter(is_backup) {
            write_offset = self.copy_record_to(to, write_offset, record, &mut new_index)?;
        }

        // Pass 2: everything else, unless this is a factory reset (which restores the device
        // to exactly its backed-up image by skipping this pass).
        if !factory_reset {
            for record in live.iter().filter(|r| !is_backup(r)) {
                write_offset = self.copy_record_to(to, write_offset, record, &mut new_index)?;
            }
        }

        self.dev.sync()?;

        // Atomic flip: only after the new area's master record and compacted records are
        // durable do we erase the old area, invalidating its master record.
        self.active = to;
        self.free_offset = write_offset;
        self.master = next_master;
        self.index = new_index;

        self.erase_area(from)?;
        self.dev.sync()?;
        Ok(())
    }

    fn write_master(&mut self, area: usize, master: MasterRecord) -> Result<u32> {
        self.append_record_raw(
            area,
            0,
            super::master::MASTER_RECORD_KEY,
            &master.encode(),
            crate::kv::Flags::empty(),
            InternalFlags::empty(),
        )
    }

    fn copy_record_to(
        &mut self,
        area: usize,
        offset: u32,
        record: &RecordView,
        new_index: &mut super::index::RamIndex,
    ) -> Result<u32> {
        let next_offset = self.append_record_raw(
            area,
            offset,
            &record.key,
            &record.data,
            record.user_flags,
            record.internal_flags,
        )?;
        new_index.insert(&record.key, offset, record.internal_flags);
        Ok(next_offset)
    }
}
