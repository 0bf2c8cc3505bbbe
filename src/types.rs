//! Core data types used throughout the cache engine

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Port assumed for server addresses that do not name one
pub const DEFAULT_SERVER_PORT: u16 = 80;

/// Current wall-clock time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Signal identity
// ============================================================================

/// External provider a signal is read from
///
/// Two data sources are equal when kind and name match and their server
/// addresses normalize to the same `host:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    /// Source kind, selects the data reader (e.g. "gsn")
    pub kind: String,
    /// Source name on the remote side (e.g. a table or virtual sensor)
    pub name: String,
    /// Optional server address, `host` or `host:port`
    #[serde(default)]
    pub server_address: Option<String>,
}

impl DataSource {
    /// Create a new data source
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            server_address: None,
        }
    }

    /// Attach a server address
    pub fn with_server(mut self, address: impl Into<String>) -> Self {
        self.server_address = Some(address.into());
        self
    }

    /// Server address as lowercase `host:port`, or `None` if not set
    pub fn normalized_server(&self) -> Option<String> {
        let raw = self.server_address.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let raw = raw.to_lowercase();
        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => return Some(raw),
            },
            None => (raw, DEFAULT_SERVER_PORT),
        };
        Some(format!("{}:{}", host, port))
    }
}

impl PartialEq for DataSource {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.normalized_server() == other.normalized_server()
    }
}

impl Eq for DataSource {}

impl Hash for DataSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.name.hash(state);
        self.normalized_server().hash(state);
    }
}

/// How devices of a data source are selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectKind {
    /// A single device identified by field/value
    Single,
    /// All devices of the source
    All,
}

impl SelectKind {
    /// Get the selector name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectKind::Single => "single",
            SelectKind::All => "all",
        }
    }

    /// Parse a selector name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(SelectKind::Single),
            "all" => Some(SelectKind::All),
            _ => None,
        }
    }
}

/// Device selector of a signal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceSelect {
    /// Selector kind
    pub kind: SelectKind,
    /// Field identifying the device (single only)
    #[serde(default)]
    pub field: Option<String>,
    /// Value of the identifying field (single only)
    #[serde(default)]
    pub value: Option<String>,
}

impl DeviceSelect {
    /// Select every device
    pub fn all() -> Self {
        Self {
            kind: SelectKind::All,
            field: None,
            value: None,
        }
    }

    /// Select one device by field and value
    pub fn single(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: SelectKind::Single,
            field: Some(field.into()),
            value: Some(value.into()),
        }
    }
}

/// Structural identity of a time series
///
/// Signals arrive as fresh request payloads, so equality and hashing are
/// derived from field values only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signal {
    /// Where the data comes from
    pub data_source: DataSource,
    /// Column holding the measured value
    pub data_field: String,
    /// Which devices contribute
    pub device_select: DeviceSelect,
    /// Column holding the timestamp
    pub time_field: String,
    /// Column holding the latitude, if the signal is location-bearing
    #[serde(default)]
    pub location_lat_field: Option<String>,
    /// Column holding the longitude, if the signal is location-bearing
    #[serde(default)]
    pub location_lng_field: Option<String>,
}

impl Signal {
    /// Create a signal selecting all devices, without location
    pub fn new(
        data_source: DataSource,
        data_field: impl Into<String>,
        time_field: impl Into<String>,
    ) -> Self {
        Self {
            data_source,
            data_field: data_field.into(),
            device_select: DeviceSelect::all(),
            time_field: time_field.into(),
            location_lat_field: None,
            location_lng_field: None,
        }
    }

    /// Replace the device selector
    pub fn with_device(mut self, device_select: DeviceSelect) -> Self {
        self.device_select = device_select;
        self
    }

    /// Attach latitude/longitude fields
    pub fn with_location(mut self, lat_field: impl Into<String>, lng_field: impl Into<String>) -> Self {
        self.location_lat_field = Some(lat_field.into());
        self.location_lng_field = Some(lng_field.into());
        self
    }

    /// Whether samples of this signal carry a location
    pub fn has_location(&self) -> bool {
        self.location_lat_field
            .as_deref()
            .map(|f| !f.is_empty())
            .unwrap_or(false)
    }

    /// Readable key used in logs, errors and sorting
    pub fn unique_key(&self) -> String {
        let mut key = format!("{}:/", self.data_source.kind);
        if let Some(server) = self.data_source.normalized_server() {
            key.push_str(&server);
            key.push('/');
        }
        key.push_str(&self.data_source.name);
        key.push(';');
        key.push_str(&self.data_field);
        key.push(';');
        key.push_str(self.device_select.kind.as_str());
        if self.device_select.kind == SelectKind::Single {
            key.push(',');
            key.push_str(self.device_select.field.as_deref().unwrap_or(""));
            key.push(',');
            key.push_str(self.device_select.value.as_deref().unwrap_or(""));
        }
        key.push(';');
        key.push_str(&self.time_field);
        if self.has_location() {
            key.push_str(";loc,");
            key.push_str(self.location_lat_field.as_deref().unwrap_or(""));
            key.push(',');
            key.push_str(self.location_lng_field.as_deref().unwrap_or(""));
        }
        key
    }

    /// Key of the signal's durable rows
    ///
    /// Every field is serialized and the server address is stored in
    /// normalized form, so two signals share a key exactly when they are
    /// equal.
    pub fn storage_key(&self) -> serde_json::Result<String> {
        let mut canonical = self.clone();
        canonical.data_source.server_address = self.data_source.normalized_server();
        serde_json::to_string(&canonical)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_key())
    }
}

// ============================================================================
// Samples
// ============================================================================

/// Geographic position, compared by value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
}

impl Location {
    /// Create a new location
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A single timestamped value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedValue {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Float value
    pub value: f64,
}

impl TimedValue {
    /// Create a new timed value
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A timestamped value with optional location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedLocationValue {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Float value
    pub value: f64,
    /// Position of the sample, if the signal is location-bearing
    pub location: Option<Location>,
}

impl TimedLocationValue {
    /// Create a sample without location
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value,
            location: None,
        }
    }

    /// Create a sample with location
    pub fn with_location(timestamp: i64, value: f64, location: Location) -> Self {
        Self {
            timestamp,
            value,
            location: Some(location),
        }
    }
}

impl From<TimedValue> for TimedLocationValue {
    fn from(v: TimedValue) -> Self {
        Self::new(v.timestamp, v.value)
    }
}

// ============================================================================
// Cache metadata snapshots
// ============================================================================

/// Read-only snapshot of one cached (signal, bucket width) entry
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDataInfo {
    /// Cached signal
    pub signal: Signal,
    /// Bucket width in seconds
    pub bucket_width: u32,
    /// Number of stored aggregate values
    pub num_elements: usize,
    /// Whether values carry locations
    pub has_location: bool,
    /// Last successful update (unix ms)
    pub last_update: Option<i64>,
    /// Timestamp of the newest raw sample seen (unix ms)
    pub last_packet_timestamp: Option<i64>,
    /// Number of reads served
    pub hits: u64,
}

/// Sort orders for [`CachedDataInfo`] listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSortKey {
    /// By signal key, ascending
    KeyAscending,
    /// Oldest update first; entries never updated come first
    LastUpdateAscending,
    /// Newest update first
    LastUpdateDescending,
    /// Oldest raw sample first; entries without samples go last
    LastPacketAscending,
    /// Most read first
    HitsDescending,
}

impl CachedDataInfo {
    /// Sort a listing in place
    pub fn sort_by_key(infos: &mut [CachedDataInfo], key: InfoSortKey) {
        infos.sort_by(|a, b| Self::compare(a, b, key));
    }

    fn compare(a: &CachedDataInfo, b: &CachedDataInfo, key: InfoSortKey) -> Ordering {
        match key {
            InfoSortKey::KeyAscending => a.signal.unique_key().cmp(&b.signal.unique_key()),
            InfoSortKey::LastUpdateAscending => a.last_update.cmp(&b.last_update),
            InfoSortKey::LastUpdateDescending => b.last_update.cmp(&a.last_update),
            InfoSortKey::LastPacketAscending => match (a.last_packet_timestamp, b.last_packet_timestamp) {
                (Some(x), Some(y)) => x.cmp(&y),
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (None, None) => Ordering::Equal,
            },
            InfoSortKey::HitsDescending => b.hits.cmp(&a.hits),
        }
    }
}

/// A known signal with the time of its last refresh attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalStaleness {
    /// The signal
    pub signal: Signal,
    /// Last refresh attempt (unix ms), 0 if never attempted
    pub last_attempt: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn signal() -> Signal {
        Signal::new(DataSource::new("gsn", "station_a"), "temperature", "timed")
    }

    #[test]
    fn test_structural_equality() {
        let a = signal();
        let b = signal();
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));

        let c = signal().with_device(DeviceSelect::single("device_id", "7"));
        assert_ne!(b, c);
    }

    #[test]
    fn test_server_address_normalization() {
        let a = DataSource::new("gsn", "s").with_server("Data.Example.org");
        let b = DataSource::new("gsn", "s").with_server("data.example.org:80");
        let c = DataSource::new("gsn", "s").with_server("data.example.org:22001");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.normalized_server().as_deref(), Some("data.example.org:80"));
        assert_eq!(DataSource::new("gsn", "s").normalized_server(), None);
    }

    #[test]
    fn test_unique_key() {
        let s = signal();
        assert_eq!(s.unique_key(), "gsn:/station_a;temperature;all;timed");

        let s = Signal::new(
            DataSource::new("gsn", "bus").with_server("gsn.local:22001"),
            "co",
            "generation_time",
        )
        .with_device(DeviceSelect::single("device_id", "12"))
        .with_location("latitude", "longitude");
        assert_eq!(
            s.unique_key(),
            "gsn:/gsn.local:22001/bus;co;single,device_id,12;generation_time;loc,latitude,longitude"
        );
        assert!(s.has_location());
    }

    #[test]
    fn test_storage_key_follows_equality() {
        let a = signal().with_location("lat", "lng");
        let b = signal().with_location("latitude", "longitude");
        assert_ne!(a, b);
        assert_ne!(a.storage_key().unwrap(), b.storage_key().unwrap());

        let mut upper = signal();
        upper.data_source = DataSource::new("gsn", "station_a").with_server("GSN.local");
        let mut lower = signal();
        lower.data_source = DataSource::new("gsn", "station_a").with_server("gsn.local:80");
        assert_eq!(upper, lower);
        assert_eq!(upper.storage_key().unwrap(), lower.storage_key().unwrap());
        assert_eq!(upper.unique_key(), lower.unique_key());
    }

    #[test]
    fn test_empty_lat_field_is_not_location() {
        let mut s = signal();
        s.location_lat_field = Some(String::new());
        assert!(!s.has_location());
    }

    #[test]
    fn test_info_sorting() {
        let info = |last_update: Option<i64>, hits: u64| CachedDataInfo {
            signal: signal(),
            bucket_width: 240,
            num_elements: 1,
            has_location: false,
            last_update,
            last_packet_timestamp: last_update,
            hits,
        };
        let mut infos = vec![info(Some(30), 1), info(None, 5), info(Some(10), 3)];

        CachedDataInfo::sort_by_key(&mut infos, InfoSortKey::LastUpdateAscending);
        let order: Vec<_> = infos.iter().map(|i| i.last_update).collect();
        assert_eq!(order, vec![None, Some(10), Some(30)]);

        CachedDataInfo::sort_by_key(&mut infos, InfoSortKey::LastPacketAscending);
        let order: Vec<_> = infos.iter().map(|i| i.last_packet_timestamp).collect();
        assert_eq!(order, vec![Some(10), Some(30), None]);

        CachedDataInfo::sort_by_key(&mut infos, InfoSortKey::HitsDescending);
        assert_eq!(infos[0].hits, 5);
    }
}
