//! Scatter-gather bookkeeping for the SG DMA engine

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};

use super::TrmError;
use crate::bus::Address;

/// Entries per SRB table: 64KiB in 4KiB pages, plus one for misalignment
pub const MAX_SG_ENTRIES: usize = 17;

/// Size of one SRB's table in DMA memory
pub const SG_TABLE_SIZE: Address = (MAX_SG_ENTRIES * SgEntry::SIZE) as Address;

/// Largest transfer the 24-bit SCSI counter takes
pub const MAX_XFER_LEN: u32 = 0x00FF_FFFF;

/// Hardware scatter-gather descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgEntry {
    pub address: Address,
    pub length: u32,
}

impl SgEntry {
    /// Descriptor size in the controller's table
    pub const SIZE: usize = 8;

    pub const fn new(address: Address, length: u32) -> Self {
        Self { address, length }
    }
}

/// A command's scatter-gather list and the position of the transfer in it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgList {
    entries: ArrayVec<SgEntry, MAX_SG_ENTRIES>,
    index: usize,
}

impl SgList {
    pub fn new(entries: &[SgEntry]) -> Result<Self, TrmError> {
        let entries = ArrayVec::try_from(entries).map_err(|_| TrmError::SgTooLong(entries.len()))?;
        Ok(Self { entries, index: 0 })
    }

    /// A list describing one contiguous buffer
    pub fn single(entry: SgEntry) -> Self {
        let mut entries = ArrayVec::new();
        entries.push(entry);
        Self { entries, index: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first entry not yet fully transferred
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Entries still (partially) to be transferred
    pub fn remaining(&self) -> &[SgEntry] {
        &self.entries[self.index..]
    }

    pub fn exhausted(&self) -> bool {
        self.index >= self.entries.len()
    }

    /// Sum of all entry lengths
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.length)).sum()
    }

    /// Advances past `xferlen` transferred bytes.
    ///
    /// Fully consumed entries are skipped and the first partially consumed
    /// entry is trimmed in place, so the remaining table describes exactly
    /// what is left of the buffer.
    pub fn consume(&mut self, mut xferlen: u32) {
        for i in self.index..self.entries.len() {
            let e = &mut self.entries[i];
            if xferlen >= e.length {
                xferlen -= e.length;
            } else {
                e.length -= xferlen;
                e.address += xferlen;
                self.index = i;
                return;
            }
        }
        self.index = self.entries.len();
    }
}

/// Bytes left in the SCSI FIFO at the end of a data-out phase.
///
/// The count register holds 16-bit words while a wide transfer is active.
pub const fn fifo_residue(count: u8, wide: bool) -> u32 {
    let count = count as u32;
    if wide { count << 1 } else { count }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(n: usize) -> SgList {
        let entries = (0..n)
            .map(|i| SgEntry::new(0x10_0000 + (i as u32) * 0x1000, 0x1000))
            .collect::<Vec<_>>();
        SgList::new(&entries).unwrap()
    }

    #[test]
    fn too_long() {
        let entries = vec![SgEntry::new(0, 512); MAX_SG_ENTRIES + 1];
        assert!(matches!(
            SgList::new(&entries),
            Err(TrmError::SgTooLong(18))
        ));
    }

    #[test]
    fn consume_whole_entries() {
        let mut sg = pages(16);
        sg.consume(5 * 0x1000);
        assert_eq!(sg.index(), 5);
        assert_eq!(sg.remaining()[0], SgEntry::new(0x10_5000, 0x1000));
        assert_eq!(sg.remaining().len(), 11);
    }

    #[test]
    fn consume_splits_entry() {
        let mut sg = pages(4);
        sg.consume(10000);
        assert_eq!(sg.index(), 2);
        assert_eq!(sg.remaining()[0], SgEntry::new(0x10_2000 + 1808, 4096 - 1808));
        assert_eq!(sg.remaining()[1], SgEntry::new(0x10_3000, 0x1000));

        // Continue from the split entry
        sg.consume(4096 - 1808 + 1);
        assert_eq!(sg.index(), 3);
        assert_eq!(sg.remaining()[0], SgEntry::new(0x10_3001, 0x0FFF));
    }

    #[test]
    fn consume_everything() {
        let mut sg = pages(3);
        sg.consume(3 * 0x1000);
        assert!(sg.exhausted());
        assert!(sg.remaining().is_empty());
    }

    #[test]
    fn conservation() {
        let mut sg = SgList::new(&[
            SgEntry::new(0x1000, 700),
            SgEntry::new(0x8000, 3000),
            SgEntry::new(0x2_0000, 333),
            SgEntry::new(0x3_0000, 4096),
        ])
        .unwrap();
        let total = sg.total();
        let mut transferred = 0u64;
        for chunk in [1u32, 699, 1000, 2001, 17, 0, 500] {
            sg.consume(chunk);
            transferred += u64::from(chunk);
            let left: u64 = sg.remaining().iter().map(|e| u64::from(e.length)).sum();
            assert_eq!(transferred + left, total);
        }
    }

    #[test]
    fn fifo_doubling() {
        assert_eq!(fifo_residue(5, false), 5);
        assert_eq!(fifo_residue(5, true), 10);
        assert_eq!(fifo_residue(0, true), 0);
    }
}
