//! Aggregation pipeline construction for time-series rollups.
//!
//! The pipeline is expressed as the stage documents of a document-database
//! aggregation framework:
//!
//! ```text
//! $match   dataPoints.<metric> exists, from <= timestamp < until
//! $group   by (bucket of timestamp, sensor): sum of values, first unit
//! $project date, metadata { sensor, period, dataType }, totalValue { value, unit }
//! $sort    date ascending
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AggregationPeriod;
use crate::error::{ErrorCode, Result, RollupError};
use crate::store::{Document, Pipeline};

/// Check that `metric` can be spliced into a field path.
pub fn validate_metric_name(metric: &str) -> Result<()> {
    if metric.is_empty() {
        return Err(RollupError::invalid_pipeline("metric name must not be empty"));
    }
    if metric.starts_with('$') || metric.contains('.') || metric.chars().any(char::is_whitespace) {
        return Err(RollupError::new(
            ErrorCode::InvalidPipeline,
            format!("metric name {:?} is not a valid field name", metric),
        ));
    }
    Ok(())
}

/// Builder for the rollup pipeline of one metric over one time range.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupPipeline {
    metric: String,
    period: AggregationPeriod,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    timezone: Option<Tz>,
}

impl RollupPipeline {
    /// Readings with `from <= timestamp < until` are rolled up.
    pub fn new(
        metric: impl Into<String>,
        period: AggregationPeriod,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Self {
        Self {
            metric: metric.into(),
            period,
            from,
            until,
            timezone: None,
        }
    }

    /// Bucket timestamps in `tz` rather than UTC.
    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = Some(tz);
        self
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn period(&self) -> AggregationPeriod {
        self.period
    }

    pub fn build(&self) -> Result<Pipeline> {
        validate_metric_name(&self.metric)?;
        if self.from >= self.until {
            return Err(RollupError::new(
                ErrorCode::InvalidPipeline,
                format!("empty time range {} .. {}", self.from, self.until),
            ));
        }

        let field = format!("dataPoints.{}", self.metric);
        let format = self.period.bucket_format();

        let mut bucket = json!({ "format": format, "date": "$timestamp" });
        let mut parse = json!({ "dateString": "$_id.date" });
        if let Some(tz) = self.timezone {
            bucket["timezone"] = json!(tz.name());
            parse["timezone"] = json!(tz.name());
        }

        let stages = vec![
            json!({
                "$match": {
                    field.clone(): { "$exists": true },
                    "timestamp": {
                        "$gte": extended_date(self.from),
                        "$lt": extended_date(self.until),
                    },
                }
            }),
            json!({
                "$group": {
                    "_id": {
                        "date": { "$dateToString": bucket },
                        "sensor": "$sensor",
                    },
                    "totalValue": { "$sum": format!("${}.data", field) },
                    "unit": { "$first": format!("${}.units", field) },
                }
            }),
            json!({
                "$project": {
                    "_id": 0,
                    "date": { "$dateFromString": parse },
                    "metadata": {
                        "sensor": "$_id.sensor",
                        "period": self.period.as_str(),
                        "dataType": self.metric,
                    },
                    "totalValue": {
                        "value": "$totalValue",
                        "unit": "$unit",
                    },
                }
            }),
            json!({ "$sort": { "date": 1 } }),
        ];

        stages.into_iter().map(into_document).collect()
    }
}

fn extended_date(at: DateTime<Utc>) -> Value {
    json!({ "$date": at.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(RollupError::with_internal(
            ErrorCode::InvalidPipeline,
            "pipeline stage is not a document",
            other.to_string(),
        )),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rolled-up Document
// ═══════════════════════════════════════════════════════════════════════════════

/// One rolled-up bucket for one sensor, as written to the target collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedReading {
    pub date: DateTime<Utc>,
    pub metadata: ReadingMetadata,
    pub total_value: TotalValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingMetadata {
    pub sensor: String,
    pub period: AggregationPeriod,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalValue {
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}
