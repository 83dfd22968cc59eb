//! Sanity rules applied to readings before they are cached.
//!
//! Some station hardware reports an exact `0.0` for a disconnected
//! temperature or humidity sensor, so by default a zero in those two
//! fields is read as "no value". The rule is configurable.

use common::config::ValidationConfig;
use common::{Error, HistoricalPoint, HistoricalSeries, Result, WidgetData};
use std::ops::RangeInclusive;
use tracing::warn;

pub trait ReadingValidator: Send + Sync {
    /// Normalize a widget payload or reject it.
    fn validate_widget(&self, data: WidgetData) -> Result<WidgetData>;

    /// Normalize a series, dropping unusable points.
    fn validate_series(&self, series: HistoricalSeries) -> Result<HistoricalSeries>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorBounds {
    pub zero_means_absent: bool,
    pub temperature_c: RangeInclusive<f64>,
    pub humidity_pct: RangeInclusive<f64>,
    pub pressure_hpa: RangeInclusive<f64>,
}

impl From<&ValidationConfig> for SensorBounds {
    fn from(config: &ValidationConfig) -> Self {
        Self {
            zero_means_absent: config.zero_means_absent,
            temperature_c: config.min_temperature_c..=config.max_temperature_c,
            humidity_pct: config.min_humidity_pct..=config.max_humidity_pct,
            pressure_hpa: config.min_pressure_hpa..=config.max_pressure_hpa,
        }
    }
}

impl Default for SensorBounds {
    fn default() -> Self {
        Self::from(&ValidationConfig::default())
    }
}

impl SensorBounds {
    fn absent_if_zero(&self, reading: Option<f64>) -> Option<f64> {
        match reading {
            Some(v) if self.zero_means_absent && v == 0.0 => None,
            other => other,
        }
    }

    fn point_problem(&self, point: &HistoricalPoint) -> Option<String> {
        check("temperature", point.temperature_c, &self.temperature_c)
            .or_else(|| check("humidity", point.humidity_pct, &self.humidity_pct))
            .or_else(|| check("pressure", point.pressure_hpa, &self.pressure_hpa))
    }
}

fn check(name: &str, reading: Option<f64>, bounds: &RangeInclusive<f64>) -> Option<String> {
    let value = reading?;
    if bounds.contains(&value) {
        None
    } else {
        Some(format!(
            "{name} {value} outside {}..={}",
            bounds.start(),
            bounds.end()
        ))
    }
}

fn non_negative(name: &str, reading: Option<f64>) -> Option<String> {
    match reading {
        Some(v) if !(v >= 0.0) => Some(format!("{name} {v} is negative")),
        _ => None,
    }
}

impl ReadingValidator for SensorBounds {
    fn validate_widget(&self, mut data: WidgetData) -> Result<WidgetData> {
        data.temperature_c = self.absent_if_zero(data.temperature_c);
        data.humidity_pct = self.absent_if_zero(data.humidity_pct);

        let problem = check("temperature", data.temperature_c, &self.temperature_c)
            .or_else(|| check("humidity", data.humidity_pct, &self.humidity_pct))
            .or_else(|| check("pressure", data.pressure_hpa, &self.pressure_hpa))
            .or_else(|| non_negative("wind speed", data.wind_speed_ms))
            .or_else(|| non_negative("rain", data.rain_mm));
        if let Some(problem) = problem {
            return Err(Error::Validation(format!("{}: {}", data.station_id, problem)));
        }

        if !data.has_readings() {
            return Err(Error::Validation(format!(
                "{}: station reported no usable sensor readings",
                data.station_id
            )));
        }
        Ok(data)
    }

    fn validate_series(&self, mut series: HistoricalSeries) -> Result<HistoricalSeries> {
        let raw = series.points.len();
        if raw == 0 {
            return Ok(series);
        }

        let mut rejected = 0usize;
        series.points = std::mem::take(&mut series.points)
            .into_iter()
            .filter_map(|mut point| {
                point.temperature_c = self.absent_if_zero(point.temperature_c);
                point.humidity_pct = self.absent_if_zero(point.humidity_pct);
                let empty = point.temperature_c.is_none()
                    && point.humidity_pct.is_none()
                    && point.pressure_hpa.is_none();
                if empty || self.point_problem(&point).is_some() {
                    rejected += 1;
                    None
                } else {
                    Some(point)
                }
            })
            .collect();

        if rejected > 0 {
            warn!(
                "{}: dropped {} of {} historical points that failed validation",
                series.station_id, rejected, raw
            );
        }
        if series.points.is_empty() {
            return Err(Error::Validation(format!(
                "{}: no valid points in historical series",
                series.station_id
            )));
        }
        Ok(series)
    }
}
