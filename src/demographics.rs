//! Typed demographic observations.
//!
//! The demographic classifier hands back loosely-shaped payloads (numeric age or
//! a bucket label, free-text gender, a confidence). They are validated here into
//! an [`Observation`] before anything reaches the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DemographicError {
    #[error("unknown age bucket: {0}")]
    UnknownAgeBucket(String),

    #[error("age out of range: {0}")]
    AgeOutOfRange(f64),

    #[error("missing age: payload carries neither an age nor an age bucket")]
    MissingAge,

    #[error("unknown gender: {0}")]
    UnknownGender(String),

    #[error("confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),

    #[error("invalid time window: {0}")]
    InvalidTimeWindow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgeBucket {
    #[serde(rename = "0-17")]
    Under18,
    #[serde(rename = "18-29")]
    From18To29,
    #[serde(rename = "30-39")]
    From30To39,
    #[serde(rename = "40-49")]
    From40To49,
    #[serde(rename = "50-59")]
    From50To59,
    #[serde(rename = "60+")]
    Over60,
}

impl AgeBucket {
    pub const ALL: [AgeBucket; 6] = [
        AgeBucket::Under18,
        AgeBucket::From18To29,
        AgeBucket::From30To39,
        AgeBucket::From40To49,
        AgeBucket::From50To59,
        AgeBucket::Over60,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgeBucket::Under18 => "0-17",
            AgeBucket::From18To29 => "18-29",
            AgeBucket::From30To39 => "30-39",
            AgeBucket::From40To49 => "40-49",
            AgeBucket::From50To59 => "50-59",
            AgeBucket::Over60 => "60+",
        }
    }

    /// Bucket a numeric age estimate.
    pub fn from_age(age: f64) -> Result<Self, DemographicError> {
        if !age.is_finite() || !(0.0..=130.0).contains(&age) {
            return Err(DemographicError::AgeOutOfRange(age));
        }
        Ok(match age {
            a if a < 18.0 => AgeBucket::Under18,
            a if a < 30.0 => AgeBucket::From18To29,
            a if a < 40.0 => AgeBucket::From30To39,
            a if a < 50.0 => AgeBucket::From40To49,
            a if a < 60.0 => AgeBucket::From50To59,
            _ => AgeBucket::Over60,
        })
    }
}

impl fmt::Display for AgeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgeBucket {
    type Err = DemographicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        AgeBucket::ALL
            .iter()
            .copied()
            .find(|b| b.as_str() == trimmed)
            .ok_or_else(|| DemographicError::UnknownAgeBucket(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = DemographicError;

    /// Accepts the classifier's labels ("Man"/"Woman") as well as the stored form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "male" | "man" | "m" => Ok(Gender::Male),
            "female" | "woman" | "f" | "w" => Ok(Gender::Female),
            "unknown" | "" => Ok(Gender::Unknown),
            other => Err(DemographicError::UnknownGender(other.to_string())),
        }
    }
}

/// Aggregated estimate stored on a person.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemographicEstimate {
    pub age_bucket: AgeBucket,
    pub gender: Gender,
    pub confidence: f64,
}

/// A validated demographic observation for one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub age_bucket: AgeBucket,
    pub gender: Gender,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
}

impl Observation {
    pub fn new(age_bucket: AgeBucket, gender: Gender, confidence: f64) -> Result<Self, DemographicError> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(DemographicError::InvalidConfidence(confidence));
        }
        Ok(Self {
            age_bucket,
            gender,
            confidence,
            mood: None,
        })
    }

    pub fn with_mood(mut self, mood: impl Into<String>) -> Self {
        let mood = mood.into().trim().to_lowercase();
        self.mood = if mood.is_empty() { None } else { Some(mood) };
        self
    }

    /// Validate a raw classifier payload.
    pub fn from_raw(raw: &RawDemographics) -> Result<Self, DemographicError> {
        let age_bucket = match (&raw.age_bucket, raw.age) {
            (Some(label), _) => label.parse()?,
            (None, Some(age)) => AgeBucket::from_age(age)?,
            (None, None) => return Err(DemographicError::MissingAge),
        };
        let gender = match &raw.gender {
            Some(g) => g.parse()?,
            None => Gender::Unknown,
        };
        let observation = Observation::new(age_bucket, gender, raw.confidence.unwrap_or(0.0))?;
        Ok(match &raw.mood {
            Some(mood) => observation.with_mood(mood.as_str()),
            None => observation,
        })
    }

    pub fn estimate(&self) -> DemographicEstimate {
        DemographicEstimate {
            age_bucket: self.age_bucket,
            gender: self.gender,
            confidence: self.confidence,
        }
    }
}

/// Payload as produced by the demographic classifier.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDemographics {
    #[serde(default)]
    pub age: Option<f64>,
    #[serde(default)]
    pub age_bucket: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub mood: Option<String>,
}

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Local time-of-day window in minutes since midnight. `start > end` wraps
/// past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl TimeWindow {
    pub fn new(start_minute: u16, end_minute: u16) -> Result<Self, DemographicError> {
        if start_minute >= MINUTES_PER_DAY || end_minute > MINUTES_PER_DAY || start_minute == end_minute {
            return Err(DemographicError::InvalidTimeWindow(format!(
                "{}-{}",
                start_minute, end_minute
            )));
        }
        Ok(Self {
            start_minute,
            end_minute,
        })
    }

    pub fn contains_minute(&self, minute: u16) -> bool {
        if self.start_minute < self.end_minute {
            minute >= self.start_minute && minute < self.end_minute
        } else {
            minute >= self.start_minute || minute < self.end_minute
        }
    }

    pub fn contains<Tz: TimeZone>(&self, now: DateTime<Utc>, tz: &Tz) -> bool {
        let local = now.with_timezone(tz);
        self.contains_minute((local.hour() * 60 + local.minute()) as u16)
    }

    /// Parse a window label. Named day parts (`morning`, `afternoon`,
    /// `evening`, `night`) and explicit `HH:MM-HH:MM` ranges are accepted;
    /// `none`, `all` and the empty string mean "all day" (`Ok(None)`).
    pub fn parse_label(label: &str) -> Result<Option<Self>, DemographicError> {
        let normalized = label.trim().to_lowercase();
        let window = match normalized.as_str() {
            "" | "none" | "all" | "any" => return Ok(None),
            "morning" => TimeWindow::new(5 * 60, 11 * 60)?,
            "afternoon" => TimeWindow::new(11 * 60, 17 * 60)?,
            "evening" => TimeWindow::new(17 * 60, 21 * 60)?,
            "night" => TimeWindow::new(21 * 60, 5 * 60)?,
            other => {
                let (start, end) = other
                    .split_once('-')
                    .ok_or_else(|| DemographicError::InvalidTimeWindow(label.to_string()))?;
                TimeWindow::new(parse_clock(start, label)?, parse_clock(end, label)?)?
            }
        };
        Ok(Some(window))
    }
}

fn parse_clock(raw: &str, label: &str) -> Result<u16, DemographicError> {
    let invalid = || DemographicError::InvalidTimeWindow(label.to_string());
    let (h, m) = raw.trim().split_once(':').ok_or_else(invalid)?;
    let hours: u16 = h.parse().map_err(|_| invalid())?;
    let minutes: u16 = m.parse().map_err(|_| invalid())?;
    if hours > 24 || minutes > 59 || (hours == 24 && minutes != 0) {
        return Err(invalid());
    }
    Ok(hours * 60 + minutes)
}
