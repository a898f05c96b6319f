//! Address-range index of generated code
//!
//! Maps non-overlapping `[start, start + size)` ranges to the code entry
//! that owns them. Generated-code regions get reused, so a registration is
//! authoritative for its whole span: every range it touches is dropped
//! before the new one goes in.

use aperture_shared::types::events::Address;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::Excluded;
use std::sync::Arc;
use tracing::trace;

use super::code_entry::CodeEntry;

#[derive(Debug, Clone)]
struct CodeEntryInfo {
    entry: Arc<CodeEntry>,
    size: u32,
}

impl CodeEntryInfo {
    fn end(&self, start: Address) -> Address {
        start.saturating_add(u64::from(self.size))
    }
}

/// Ordered map from start address to code range
#[derive(Debug, Default)]
pub struct CodeMap {
    code_map: BTreeMap<Address, CodeEntryInfo>,
}

impl CodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry` for `[start, start + size)`, dropping every existing
    /// range that intersects it, including partial overlaps.
    pub fn add_code(&mut self, start: Address, entry: Arc<CodeEntry>, size: u32) {
        self.delete_all_covered_code(start, start.saturating_add(u64::from(size)));
        self.code_map.insert(start, CodeEntryInfo { entry, size });
    }

    fn delete_all_covered_code(&mut self, start: Address, end: Address) {
        let mut doomed = Vec::new();
        if let Some((&key, info)) = self.code_map.range(..=start).next_back() {
            if info.end(key) > start {
                doomed.push(key);
            }
        }
        if end > start {
            doomed.extend(
                self.code_map
                    .range((Excluded(start), Excluded(end)))
                    .map(|(&key, _)| key),
            );
        }
        for key in doomed {
            if let Some(info) = self.code_map.remove(&key) {
                trace!(
                    "Dropping code {:#x}+{} ({}) overwritten by {:#x}",
                    key,
                    info.size,
                    info.entry.name(),
                    start
                );
            }
        }
    }

    /// Entry whose range contains `addr`.
    pub fn find_entry(&self, addr: Address) -> Option<&Arc<CodeEntry>> {
        self.lookup(addr).map(|(_, entry)| entry)
    }

    /// Start of the range containing `addr` and its entry.
    pub fn lookup(&self, addr: Address) -> Option<(Address, &Arc<CodeEntry>)> {
        let (&start, info) = self.code_map.range(..=addr).next_back()?;
        (addr < info.end(start)).then_some((start, &info.entry))
    }

    /// Re-key the range starting at `from` to start at `to`. Moving onto
    /// itself or moving an unknown range does nothing.
    pub fn move_code(&mut self, from: Address, to: Address) {
        if from == to {
            return;
        }
        let Some(info) = self.code_map.remove(&from) else {
            return;
        };
        self.add_code(to, info.entry, info.size);
    }

    /// `(start, size, entry)` for every range in address order.
    pub fn entries(&self) -> impl Iterator<Item = (Address, u32, &Arc<CodeEntry>)> {
        self.code_map
            .iter()
            .map(|(&start, info)| (start, info.size, &info.entry))
    }

    pub fn len(&self) -> usize {
        self.code_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code_map.is_empty()
    }

    /// One `address size name` line per range.
    pub fn dump(&self, out: &mut impl fmt::Write) -> fmt::Result {
        for (start, size, entry) in self.entries() {
            writeln!(out, "{:#x} {:5} {}", start, size, entry.name())?;
        }
        Ok(())
    }
}
