//! Cache-first data access for station readings.
//!
//! Each logical request is answered from the TTL cache when possible and
//! otherwise fetched once, no matter how many callers ask at the same time.

pub mod repository;
pub mod request;
pub mod validation;

pub use repository::{DataRepository, FetchPolicy, FetchState, StationSource};
pub use request::DataRequest;
pub use validation::{ReadingValidator, SensorBounds};
