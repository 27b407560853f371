// Shared identifiers and storage-layout constants.
//
// Every subsystem speaks in terms of the aliases defined here: transactions
// are numbered, pages live inside partitions, and log records are addressed
// by LSN. The partition of a page is encoded in the page number itself, so
// translating between the two is pure arithmetic and never requires I/O.

/// Unique identifier for transactions.
pub type TransactionId = u64;

/// Page number; the partition number occupies the high 32 bits.
pub type PageNum = u64;

/// Partition number within the disk space manager.
pub type PartNum = u32;

/// Log sequence number. LSN 0 is reserved for the master record.
pub type Lsn = u64;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Bytes at the start of every page reserved for the page LSN.
pub const PAGE_HEADER_SIZE: usize = 8;

/// Usable data bytes per page.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Partition reserved for the write-ahead log.
pub const LOG_PARTITION: PartNum = 0;

/// Partition that a page belongs to.
#[inline]
pub fn part_num(page: PageNum) -> PartNum {
    (page >> 32) as PartNum
}

/// Index of a page within its partition.
#[inline]
pub fn page_index(page: PageNum) -> u32 {
    (page & 0xFFFF_FFFF) as u32
}

/// Page number for a (partition, index) pair.
#[inline]
pub fn page_num(part: PartNum, index: u32) -> PageNum {
    ((part as u64) << 32) | index as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_number_arithmetic() {
        let page = page_num(3, 17);
        assert_eq!(part_num(page), 3);
        assert_eq!(page_index(page), 17);
        assert_eq!(part_num(42), LOG_PARTITION);
    }

    #[test]
    fn test_effective_page_size() {
        assert_eq!(EFFECTIVE_PAGE_SIZE + PAGE_HEADER_SIZE, PAGE_SIZE);
    }
}
