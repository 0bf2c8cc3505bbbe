//! External data reader contract
//!
//! A [`DataReader`] talks to one kind of remote source. The engine keeps one
//! reader per source kind in a [`ReaderRegistry`] and never retries a failed
//! fetch itself: the next scheduling round does.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, ReaderError, Result};
use crate::types::{SelectKind, Signal, TimedLocationValue};

/// Reads raw samples of a signal from an external source
#[async_trait]
pub trait DataReader: Send + Sync {
    /// Check that the signal describes data this source can serve
    fn validate(&self, signal: &Signal) -> std::result::Result<(), ReaderError>;

    /// Fetch samples ordered by ascending timestamp
    ///
    /// # Arguments
    /// * `start` - Inclusive lower time bound, `None` for unbounded
    /// * `end` - Inclusive upper time bound, `None` for unbounded
    /// * `row_limit` - Maximum number of rows, 0 for unlimited
    async fn fetch(
        &self,
        signal: &Signal,
        start: Option<i64>,
        end: Option<i64>,
        row_limit: usize,
    ) -> std::result::Result<Vec<TimedLocationValue>, ReaderError>;
}

/// Data readers keyed by source kind
#[derive(Clone, Default)]
pub struct ReaderRegistry {
    readers: HashMap<String, Arc<dyn DataReader>>,
}

impl ReaderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reader` for sources of `kind`, replacing any previous one
    pub fn register(&mut self, kind: impl Into<String>, reader: Arc<dyn DataReader>) {
        self.readers.insert(kind.into(), reader);
    }

    /// Reader for a source kind
    pub fn get(&self, kind: &str) -> Option<Arc<dyn DataReader>> {
        self.readers.get(kind).cloned()
    }

    /// Reader for a source kind, or `NoReader`
    pub fn require(&self, kind: &str) -> Result<Arc<dyn DataReader>> {
        self.get(kind).ok_or_else(|| Error::NoReader(kind.to_string()))
    }

    /// Registered source kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.readers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for ReaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn invalid(reason: &str) -> Error {
    Error::Reader(ReaderError::InvalidSignal(reason.to_string()))
}

fn blank(field: &Option<String>) -> bool {
    field.as_deref().map_or(true, str::is_empty)
}

/// Validate a user-supplied signal against the registry
///
/// Checks the structural fields first, then asks the source's reader.
pub fn validate_signal(signal: &Signal, registry: &ReaderRegistry) -> Result<()> {
    let source = &signal.data_source;
    if source.kind.is_empty() || source.name.is_empty() {
        return Err(invalid("data source spec is incomplete"));
    }
    if signal.data_field.is_empty() {
        return Err(invalid("data field is missing"));
    }
    if signal.time_field.is_empty() {
        return Err(invalid("time field is missing"));
    }

    let reader = registry
        .get(&source.kind)
        .ok_or_else(|| invalid("unknown data source kind"))?;
    reader.validate(signal)?;

    if signal.device_select.kind == SelectKind::Single
        && (blank(&signal.device_select.field) || blank(&signal.device_select.value))
    {
        return Err(invalid("device selection is incomplete"));
    }
    if signal.location_lat_field.is_some() != signal.location_lng_field.is_some() {
        return Err(invalid("location field spec is incomplete"));
    }
    Ok(())
}
