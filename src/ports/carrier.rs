//! Carrier pickup-point lookup (Mondial Relay, Colissimo).

use async_trait::async_trait;
use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::domain::aggregates::Carrier;

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("carrier service unreachable: {0}")]
    Unavailable(String),
    #[error("carrier rejected the search: {0}")]
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PickupPoint {
    pub id: String,
    pub name: String,
    pub address: String,
    pub postal_code: String,
    pub city: String,
    pub country: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub distance_m: Option<u32>,
    pub hours: Vec<(Weekday, OpeningHours)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Morning and afternoon slots of one day. A closed half-day is `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    pub am: Option<TimeRange>,
    pub pm: Option<TimeRange>,
}

impl OpeningHours {
    /// Parses the carrier's compact day format, `"09:00-12:00 14:00-18:00"`.
    /// `00:00-00:00` marks a closed slot; a day with no open slot is `None`.
    pub fn parse_compact(raw: &str) -> Option<Self> {
        let mut slots = raw.split_whitespace();
        let am = slots.next().and_then(parse_range);
        let pm = slots.next().and_then(parse_range);
        if am.is_none() && pm.is_none() { return None; }
        Some(Self { am, pm })
    }
}

fn parse_range(raw: &str) -> Option<TimeRange> {
    let (start, end) = raw.split_once('-')?;
    let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
    let midnight = NaiveTime::from_hms_opt(0, 0, 0)?;
    if start == midnight { return None; }
    Some(TimeRange { start, end })
}

#[async_trait]
pub trait CarrierRatingService: Send + Sync {
    fn carrier(&self) -> Carrier;

    async fn find_pickup_points(&self, postal_code: &str, country: &str, weight_grams: u32) -> Result<Vec<PickupPoint>, CarrierError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime { NaiveTime::from_hms_opt(h, m, 0).unwrap() }

    #[test]
    fn test_full_day() {
        let hours = OpeningHours::parse_compact("09:00-12:00  14:00-18:30").unwrap();
        assert_eq!(hours.am, Some(TimeRange { start: t(9, 0), end: t(12, 0) }));
        assert_eq!(hours.pm, Some(TimeRange { start: t(14, 0), end: t(18, 30) }));
    }

    #[test]
    fn test_closed_slots() {
        assert_eq!(OpeningHours::parse_compact("00:00-00:00 00:00-00:00"), None);
        assert_eq!(OpeningHours::parse_compact(""), None);
        let afternoon_only = OpeningHours::parse_compact("00:00-00:00 14:00-19:00").unwrap();
        assert!(afternoon_only.am.is_none());
        assert!(afternoon_only.pm.is_some());
    }
}
