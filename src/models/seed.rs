use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Deserializer};

/// The published menu of known schedules.
#[derive(Debug, Clone, Deserialize)]
pub struct Seed {
    pub version: u32,
    pub schedules: Vec<SeedSchedule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSchedule {
    pub version: u32,
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    pub title: String,
    pub start: String,
    pub end: String,
    /// Kept as raw JSON text; only the presentation layer interprets it.
    #[serde(default, deserialize_with = "raw_json")]
    pub metadata: Option<String>,
}

fn raw_json<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_null()).map(|v| v.to_string()))
}

impl SeedSchedule {
    /// Seeds only carry dates. Pretend one-day events run 06:00-18:00 and longer
    /// ones noon to noon; exact times arrive once the schedule itself is loaded.
    pub fn time_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let (Some(start), Some(end)) = (parse_day(&self.start), parse_day(&self.end)) else {
            tracing::error!("Corrupted start/end date in seed entry {}", self.url);
            let now = Utc::now();
            return (now, now);
        };

        let (start_hour, end_hour) = if start == end { (6, 18) } else { (12, 12) };
        (at_hour(start, start_hour), at_hour(end, end_hour))
    }
}

fn parse_day(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

fn at_hour(day: NaiveDate, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    day.and_time(time).and_utc()
}
