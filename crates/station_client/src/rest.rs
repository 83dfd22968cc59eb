//! REST client for the station API.
//!
//! Covers: station catalog, live widget readings, historical ranges.
//! All calls go through the interceptor chain it was built with.

use common::{DateRange, Error, HistoricalSeries, Result, StationId, StationSummary, WidgetData};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::interceptors::InterceptorChain;
use crate::transport::{ApiRequest, ApiResponse};

const STATIONS_PATH: &str = "/api/v1/stations";

#[derive(Debug, Clone)]
pub struct StationApi {
    chain: InterceptorChain,
}

impl StationApi {
    pub fn new(chain: InterceptorChain) -> Self {
        Self { chain }
    }

    /// Send `request` and decode a JSON body, classifying failures by status.
    pub async fn get_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let path = request.path.clone();
        let response = self.chain.execute(request).await?;
        decode(&path, response)
    }

    // ── Read endpoints ────────────────────────────────────────────────

    pub async fn stations(&self) -> Result<Vec<StationSummary>> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            stations: Vec<StationSummary>,
        }

        let w: Wrapper = self.get_json(ApiRequest::get(STATIONS_PATH)).await?;
        debug!("Fetched {} stations", w.stations.len());
        Ok(w.stations)
    }

    pub async fn widget_data(&self, station: &StationId) -> Result<WidgetData> {
        let path = station_path(station, "widget");
        self.get_json(ApiRequest::get(path)).await
    }

    pub async fn historical(&self, station: &StationId, range: &DateRange) -> Result<HistoricalSeries> {
        if !range.is_valid() {
            return Err(Error::BadRequest(format!(
                "date range starts after it ends ({} > {})",
                range.from, range.to
            )));
        }

        let request = ApiRequest::get(station_path(station, "history"))
            .with_query("from", range.from.format("%Y-%m-%d"))
            .with_query("to", range.to.format("%Y-%m-%d"));
        let series: HistoricalSeries = self.get_json(request).await?;
        debug!(
            "Fetched {} historical points for {} ({} to {})",
            series.points.len(),
            station,
            range.from,
            range.to
        );
        Ok(series)
    }
}

fn station_path(station: &StationId, leaf: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(station.as_str().as_bytes()).collect();
    format!("{}/{}/{}", STATIONS_PATH, encoded.replace('+', "%20"), leaf)
}

/// Status classification, then body checks: blank or `null` is an empty body.
pub(crate) fn decode<T: DeserializeOwned>(path: &str, response: ApiResponse) -> Result<T> {
    if !response.is_success() {
        return Err(response.error());
    }

    let body = trim_whitespace(&response.body);
    if body.is_empty() || body == b"null" {
        return Err(Error::EmptyBody(path.to_string()));
    }

    serde_json::from_slice(body).map_err(|e| Error::Decode(format!("{path}: {e}")))
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
