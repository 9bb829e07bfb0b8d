//! Result of a full-partition integrity walk
//! (`PartitionRoot::check_integrity`).

/// Counters from scanning every super page, span and freelist of a
/// partition. `errors_found` is zero on a healthy heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntegrityResult {
    pub total_super_pages: usize,
    pub total_spans: usize,
    pub direct_map_regions: usize,
    /// Live slots: allocated from spans plus one per direct-map region.
    /// Slots parked in thread caches count as live.
    pub slots_in_use: usize,
    /// Spans whose allocated + free + unprovisioned counts disagree with
    /// the bucket geometry.
    pub span_inconsistencies: usize,
    /// Freelist links that escape their span or break slot alignment.
    pub freelist_corruptions: usize,
    pub errors_found: usize,
}
