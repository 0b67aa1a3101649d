/// MediaStore — the record map and the selection derived from it.
///
/// Purely synchronous; owned by the coordinator loop and never shared.  Every
/// mutation goes through `report` or `evict`, both of which recompute the
/// selection before returning, so `selection` always equals
/// `select_current(records)`.
use std::collections::HashMap;

use media_proto::config::VolumePolicy;
use media_proto::record::{AggregateView, MediaReport, TabMediaRecord};
use media_proto::TabId;

pub struct MediaStore {
    records: HashMap<TabId, TabMediaRecord>,
    selection: Option<TabId>,
    /// Process-wide volume, reported when the selection has none.
    volume: u8,
    volume_policy: VolumePolicy,
    /// Last stamp handed out; stamps are strictly increasing.
    last_stamp: i64,
}

impl MediaStore {
    pub fn new(volume: u8, volume_policy: VolumePolicy) -> Self {
        Self {
            records: HashMap::new(),
            selection: None,
            volume: volume.min(100),
            volume_policy,
            last_stamp: i64::MIN,
        }
    }

    /// Create or merge the record for `tab_id`, stamping it with `now_ms`.
    /// A report without a tab handle is dropped.  Returns whether anything
    /// was applied.
    pub fn report(&mut self, tab_id: Option<TabId>, report: MediaReport, now_ms: i64) -> bool {
        let Some(tab_id) = tab_id else {
            return false;
        };
        let stamp = self.next_stamp(now_ms);
        let record = self
            .records
            .entry(tab_id)
            .or_insert_with(|| TabMediaRecord::new(tab_id));
        record.merge(report);
        record.last_update = stamp;
        self.recompute();
        true
    }

    /// Remove the record for `tab_id`.  Returns whether one existed.
    pub fn evict(&mut self, tab_id: TabId) -> bool {
        let removed = self.records.remove(&tab_id).is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    pub fn selection(&self) -> Option<&TabMediaRecord> {
        self.selection.and_then(|id| self.records.get(&id))
    }

    pub fn selected_tab(&self) -> Option<TabId> {
        self.selection
    }

    pub fn get(&self, tab_id: TabId) -> Option<&TabMediaRecord> {
        self.records.get(&tab_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, ordered by tab handle.
    pub fn records(&self) -> Vec<TabMediaRecord> {
        let mut all: Vec<_> = self.records.values().cloned().collect();
        all.sort_by_key(|r| r.tab_id);
        all
    }

    /// Snapshot for UI consumers.
    pub fn view(&self) -> AggregateView {
        match self.selection() {
            Some(record) => {
                let volume = match self.volume_policy {
                    VolumePolicy::TrackSelection => record.volume.unwrap_or(self.volume),
                    VolumePolicy::Global => self.volume,
                };
                AggregateView::from_selection(record, volume)
            }
            None => AggregateView::empty(self.volume),
        }
    }

    /// Tabs whose last report is older than `threshold_ms` at `now_ms`.
    pub fn stale_tabs(&self, now_ms: i64, threshold_ms: u64) -> Vec<TabId> {
        let threshold = i64::try_from(threshold_ms).unwrap_or(i64::MAX);
        let mut stale: Vec<_> = self
            .records
            .values()
            .filter(|r| now_ms.saturating_sub(r.last_update) > threshold)
            .map(|r| r.tab_id)
            .collect();
        stale.sort_unstable();
        stale
    }

    fn next_stamp(&mut self, now_ms: i64) -> i64 {
        let stamp = if self.last_stamp == i64::MIN {
            now_ms
        } else {
            now_ms.max(self.last_stamp.saturating_add(1))
        };
        self.last_stamp = stamp;
        stamp
    }

    fn recompute(&mut self) {
        self.selection = select_current(self.records.values()).map(|r| r.tab_id);
    }
}

/// The record judged "active": among tabs that are playing or expose media,
/// the most recently updated one.  Equal stamps go to the smaller tab handle.
pub fn select_current<'a, I>(records: I) -> Option<&'a TabMediaRecord>
where
    I: IntoIterator<Item = &'a TabMediaRecord>,
{
    records
        .into_iter()
        .filter(|r| r.is_candidate())
        .max_by(|a, b| {
            a.last_update
                .cmp(&b.last_update)
                .then_with(|| b.tab_id.cmp(&a.tab_id))
        })
}
