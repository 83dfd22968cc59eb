//! Logical data requests and their cache identity.

use common::config::CacheConfig;
use common::{DateRange, StationId};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataRequest {
    /// Latest readings for the live widget.
    Widget { station: StationId },
    Historical { station: StationId, range: DateRange },
    /// The station catalog.
    Stations,
}

impl DataRequest {
    pub fn widget(station: impl Into<StationId>) -> Self {
        DataRequest::Widget {
            station: station.into(),
        }
    }

    pub fn historical(station: impl Into<StationId>, range: DateRange) -> Self {
        DataRequest::Historical {
            station: station.into(),
            range,
        }
    }

    /// Deterministic key; equal requests always map to the same key.
    pub fn cache_key(&self) -> String {
        match self {
            DataRequest::Widget { station } => format!("widget:{station}"),
            DataRequest::Historical { station, range } => {
                format!("historical:{}:{}:{}", station, range.from, range.to)
            }
            DataRequest::Stations => "stations".to_string(),
        }
    }

    /// Lifetime of a cached response for this class of request.
    pub fn ttl(&self, cache: &CacheConfig) -> Duration {
        match self {
            DataRequest::Widget { .. } => cache.widget_ttl(),
            DataRequest::Historical { .. } => cache.historical_ttl(),
            DataRequest::Stations => cache.stations_ttl(),
        }
    }
}

impl fmt::Display for DataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}
