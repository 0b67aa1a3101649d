use serde::{Deserialize, Deserializer, Serialize};

use crate::protocol::TabId;

/// Everything the coordinator knows about one tab that has reported media.
///
/// Records are only ever built by merging [`MediaReport`]s; `last_update` is
/// stamped by the coordinator on receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TabMediaRecord {
    pub tab_id: TabId,
    pub has_media: bool,
    pub is_playing: bool,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub source: Option<String>,
    pub duration: f64,
    pub current_time: f64,
    /// 0-100.  `None` until a report carries a volume.
    pub volume: Option<u8>,
    pub can_control: bool,
    /// Page the media was last detected on (diagnostics only).
    #[serde(default)]
    pub url: Option<String>,
    /// Receipt time of the last report, wall-clock ms.
    pub last_update: i64,
}

impl TabMediaRecord {
    pub fn new(tab_id: TabId) -> Self {
        Self {
            tab_id,
            ..Self::default()
        }
    }

    /// Field-wise merge: every field present in `report` overwrites, absent
    /// fields keep their prior value.  `last_update` is left to the caller.
    pub fn merge(&mut self, report: MediaReport) {
        if let Some(v) = report.has_media {
            self.has_media = v;
        }
        if let Some(v) = report.is_playing {
            self.is_playing = v;
        }
        if let Some(v) = report.title {
            self.title = v;
        }
        if let Some(v) = report.artist {
            self.artist = v;
        }
        if let Some(v) = report.source {
            self.source = v;
        }
        if let Some(v) = report.duration {
            self.duration = non_negative(v);
        }
        if let Some(v) = report.current_time {
            self.current_time = non_negative(v);
        }
        if let Some(v) = report.volume {
            self.volume = Some(clamp_volume(v));
        }
        if let Some(v) = report.can_control {
            self.can_control = v;
        }
        if let Some(v) = report.url {
            self.url = v;
        }
    }

    /// Whether this record is a candidate for the current selection.
    pub fn is_candidate(&self) -> bool {
        self.is_playing || self.has_media
    }
}

/// A partial record pushed by a Report Source.
///
/// For the nullable string fields the outer `Option` means "present in the
/// report" and the inner one the value itself, so `"title": null` clears a
/// title while a missing `title` keeps it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MediaReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_media: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub artist: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub source: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_control: Option<bool>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub url: Option<Option<String>>,
}

impl MediaReport {
    /// Snapshot of a full record as a report, used by sources answering
    /// `GET_CURRENT_STATE`.
    pub fn from_record(record: &TabMediaRecord) -> Self {
        Self {
            has_media: Some(record.has_media),
            is_playing: Some(record.is_playing),
            title: Some(record.title.clone()),
            artist: Some(record.artist.clone()),
            source: Some(record.source.clone()),
            duration: Some(record.duration),
            current_time: Some(record.current_time),
            volume: record.volume.map(f64::from),
            can_control: Some(record.can_control),
            url: None,
        }
    }
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

/// Round and clamp a volume to the 0-100 range.  NaN maps to 0.
pub fn clamp_volume(v: f64) -> u8 {
    if v.is_nan() {
        return 0;
    }
    v.round().clamp(0.0, 100.0) as u8
}

/// Read-only projection of the current selection, as shown by UI consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AggregateView {
    pub has_media: bool,
    pub is_playing: bool,
    pub current_track: Option<String>,
    pub artist: Option<String>,
    pub source: Option<String>,
    pub duration: f64,
    pub current_time: f64,
    pub volume: u8,
    pub can_control: bool,
    pub tab_id: Option<TabId>,
}

impl AggregateView {
    /// The view when nothing is selected.
    pub fn empty(volume: u8) -> Self {
        Self {
            volume,
            ..Self::default()
        }
    }

    pub fn from_selection(record: &TabMediaRecord, volume: u8) -> Self {
        Self {
            has_media: true,
            is_playing: record.is_playing,
            current_track: non_empty(&record.title),
            artist: non_empty(&record.artist),
            source: non_empty(&record.source),
            duration: record.duration,
            current_time: record.current_time,
            volume,
            can_control: record.can_control,
            tab_id: Some(record.tab_id),
        }
    }
}

/// Blank strings are shown as absent.
fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|s| !s.is_empty()).map(str::to_string)
}
