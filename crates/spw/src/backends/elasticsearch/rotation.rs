use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;

/// 🗓️ How often the target index rolls over to a fresh, date-suffixed name.
///
/// Suffixes are computed in UTC at write time, so a batch that straddles
/// midnight lands entirely in the index of the moment it was written.
///
/// | Rotation | Example for index `logs` |
/// |---|---|
/// | `NoRotation` | `logs` |
/// | `OneHour` | `logs-2024-03-07-13` |
/// | `OneDay` | `logs-2024-03-07` |
/// | `OneWeek` | `logs-2024-w10` (ISO week and ISO week-year) |
/// | `OneMonth` | `logs-2024-03` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum IndexRotation {
    #[default]
    #[serde(alias = "none", alias = "NONE")]
    NoRotation,
    #[serde(alias = "hourly")]
    OneHour,
    #[serde(alias = "daily")]
    OneDay,
    #[serde(alias = "weekly")]
    OneWeek,
    #[serde(alias = "monthly")]
    OneMonth,
}

impl IndexRotation {
    /// 🎯 The concrete index name for `base` at instant `now`.
    pub fn resolve(&self, base: &str, now: DateTime<Utc>) -> String {
        match self {
            Self::NoRotation => base.to_string(),
            Self::OneHour => format!("{base}-{}", now.format("%Y-%m-%d-%H")),
            Self::OneDay => format!("{base}-{}", now.format("%Y-%m-%d")),
            Self::OneWeek => {
                // -- 📆 ISO week-year, not calendar year: Dec 30 can belong to week 1 of next year
                let week = now.iso_week();
                format!("{base}-{}-w{:02}", week.year(), week.week())
            }
            Self::OneMonth => format!("{base}-{}", now.format("%Y-%m")),
        }
    }
}
