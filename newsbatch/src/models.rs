use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Time-of-day tag of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Morning,
    Noon,
    Evening,
}

impl BatchKind {
    /// Classify an hour of day (0-23): before 10 is morning, before 16 is noon.
    pub fn for_hour(hour: u32) -> Self {
        if hour < 10 {
            BatchKind::Morning
        } else if hour < 16 {
            BatchKind::Noon
        } else {
            BatchKind::Evening
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Morning => "morning",
            BatchKind::Noon => "noon",
            BatchKind::Evening => "evening",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "morning" => Ok(BatchKind::Morning),
            "noon" => Ok(BatchKind::Noon),
            "evening" => Ok(BatchKind::Evening),
            other => bail!("unknown batch kind: {}", other),
        }
    }
}

/// Trailing period covered by an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisWindow {
    #[serde(rename = "3_day")]
    ThreeDay,
    #[serde(rename = "7_day")]
    SevenDay,
}

impl AnalysisWindow {
    /// Windows in the order the pipeline runs them
    pub const ALL: [AnalysisWindow; 2] = [AnalysisWindow::ThreeDay, AnalysisWindow::SevenDay];

    pub fn days(&self) -> i64 {
        match self {
            AnalysisWindow::ThreeDay => 3,
            AnalysisWindow::SevenDay => 7,
        }
    }

    /// Anything other than 7 maps to the 3-day window.
    pub fn from_days(days: i64) -> Self {
        if days == 7 {
            AnalysisWindow::SevenDay
        } else {
            AnalysisWindow::ThreeDay
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisWindow::ThreeDay => "3_day",
            AnalysisWindow::SevenDay => "7_day",
        }
    }
}

impl fmt::Display for AnalysisWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisWindow {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "3_day" => Ok(AnalysisWindow::ThreeDay),
            "7_day" => Ok(AnalysisWindow::SevenDay),
            other => bail!("unknown analysis window: {}", other),
        }
    }
}

/// A headline candidate returned by the news fetcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsHeadline {
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: i64,
    pub kind: BatchKind,
    /// Calendar day, `YYYY-MM-DD`
    pub date: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBatch {
    pub kind: BatchKind,
    pub date: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItemRecord {
    pub id: i64,
    pub batch_id: i64,
    pub title: String,
    pub content: String,
    pub url: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNewsItem {
    pub batch_id: i64,
    pub title: String,
    pub content: String,
    pub url: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub batch_id: i64,
    pub window: AnalysisWindow,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub batch_id: i64,
    pub window: AnalysisWindow,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted visit counter; `key` is a client IP or the total key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitCounterRecord {
    pub key: String,
    pub count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_kind_hour_boundaries() {
        for hour in 0..10 {
            assert_eq!(BatchKind::for_hour(hour), BatchKind::Morning, "hour {}", hour);
        }
        for hour in 10..16 {
            assert_eq!(BatchKind::for_hour(hour), BatchKind::Noon, "hour {}", hour);
        }
        for hour in 16..24 {
            assert_eq!(BatchKind::for_hour(hour), BatchKind::Evening, "hour {}", hour);
        }
    }

    #[test]
    fn window_from_days_defaults_to_three() {
        assert_eq!(AnalysisWindow::from_days(7), AnalysisWindow::SevenDay);
        assert_eq!(AnalysisWindow::from_days(3), AnalysisWindow::ThreeDay);
        assert_eq!(AnalysisWindow::from_days(30), AnalysisWindow::ThreeDay);
    }

    #[test]
    fn tags_parse_back() {
        assert_eq!("evening".parse::<BatchKind>().unwrap(), BatchKind::Evening);
        assert_eq!("7_day".parse::<AnalysisWindow>().unwrap(), AnalysisWindow::SevenDay);
        assert!("weekly".parse::<AnalysisWindow>().is_err());
    }
}
