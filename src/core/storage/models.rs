use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Timestamps are stored as sortable UTC strings so both dialects compare
/// them the same way.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Success => "success",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "success" => Ok(ProcessingStatus::Success),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(format!("unknown processing status `{other}`")),
        }
    }
}

/// Terminal state a consumer reports for a claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn status(&self) -> ProcessingStatus {
        match self {
            Outcome::Success => ProcessingStatus::Success,
            Outcome::Failed => ProcessingStatus::Failed,
        }
    }
}

/// A feed row handed to a consumer by the claim queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClaimedRecord {
    pub id: i64,
    pub title: String,
    pub link: String,
    pub guid: String,
    pub summary: Option<String>,
    pub published_at: Option<String>,
    pub full_content: Option<String>,
    pub content_fetched_at: Option<String>,
    pub processing_status: String,
    pub created_at: String,
}

/// A digest product handed to a consumer by the claim queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClaimedProduct {
    pub id: i64,
    pub product_name: String,
    pub tagline: Option<String>,
    pub description: Option<String>,
    pub product_url: Option<String>,
    pub image_url: Option<String>,
    pub ph_publish_date: String,
    pub source_guid: String,
    pub processing_status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub table: String,
    pub total: i64,
    pub today: i64,
    pub latest_created_at: Option<String>,
    pub pending: i64,
    pub processing: i64,
    pub success: i64,
    pub failed: i64,
}
