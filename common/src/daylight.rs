//! Day/night gate.
//!
//! With a synchronised wall clock the gate follows the sun: sunrise and
//! sunset for the site are computed with the standard almanac algorithm
//! (zenith 90.833°, about one minute of error at mid latitudes) and cached
//! for up to an hour. Until the clock is trustworthy a fixed night window
//! stands in.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Timelike};
use log::debug;
use serde::Serialize;

use crate::{clock::Millis, config::SiteConfig};

const MINUTES_PER_DAY: i32 = 24 * 60;
const OFFICIAL_ZENITH_DEG: f64 = 90.833;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SolarDay {
    /// Local minute-of-day of sunrise and sunset.
    Normal {
        #[serde(rename = "sunriseMinute")]
        sunrise_minute: u16,
        #[serde(rename = "sunsetMinute")]
        sunset_minute: u16,
    },
    PolarNight,
    MidnightSun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaylightSource {
    Almanac,
    Fallback,
}

#[derive(Debug, Clone, Copy)]
struct SolarCache {
    day: SolarDay,
    date: NaiveDate,
    computed_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Daylight {
    pub dark: bool,
    pub source: DaylightSource,
    #[serde(rename = "minuteOfDay")]
    pub minute_of_day: u16,
}

#[derive(Debug, Clone)]
pub struct DaylightOracle {
    site: SiteConfig,
    refresh_ms: u32,
    cache: Option<SolarCache>,
}

impl DaylightOracle {
    pub fn new(site: SiteConfig, refresh_ms: u32) -> Self {
        Self {
            site,
            refresh_ms,
            cache: None,
        }
    }

    pub fn is_dark(&mut self, now: Millis, wall: DateTime<FixedOffset>) -> bool {
        self.assess(now, wall).dark
    }

    pub fn assess(&mut self, now: Millis, wall: DateTime<FixedOffset>) -> Daylight {
        let minute = (wall.hour() * 60 + wall.minute()) as u16;

        if wall.timestamp() < self.site.min_valid_epoch {
            return Daylight {
                dark: in_window(
                    minute,
                    self.site.night_start_minute,
                    self.site.night_end_minute,
                ),
                source: DaylightSource::Fallback,
                minute_of_day: minute,
            };
        }

        let day = self.solar_day(now, wall);
        Daylight {
            dark: dark_for(day, minute, self.site.dark_margin_min),
            source: DaylightSource::Almanac,
            minute_of_day: minute,
        }
    }

    /// Today's cached almanac entry, if one has been computed.
    pub fn cached(&self) -> Option<SolarDay> {
        self.cache.map(|cache| cache.day)
    }

    fn solar_day(&mut self, now: Millis, wall: DateTime<FixedOffset>) -> SolarDay {
        if let Some(cache) = self.cache {
            if !now.has_elapsed(cache.computed_at, self.refresh_ms) {
                return cache.day;
            }
        }

        let date = wall.date_naive();
        let offset_min = wall.offset().local_minus_utc() / 60;
        let day = solar_day_for(date, self.site.latitude, self.site.longitude, offset_min);
        debug!("almanac for {date}: {day:?}");

        self.cache = Some(SolarCache {
            day,
            date,
            computed_at: now,
        });
        day
    }

    pub fn cached_date(&self) -> Option<NaiveDate> {
        self.cache.map(|cache| cache.date)
    }
}

/// Sunrise and sunset for `date` at the given coordinates, expressed as
/// minutes after local midnight for a clock `offset_min` minutes ahead of UTC.
pub fn solar_day_for(date: NaiveDate, latitude: f64, longitude: f64, offset_min: i32) -> SolarDay {
    let day_of_year = f64::from(date.ordinal());
    let rise = sun_event_utc_hours(day_of_year, latitude, longitude, true);
    let set = sun_event_utc_hours(day_of_year, latitude, longitude, false);

    match (rise, set) {
        (SunEvent::At(rise), SunEvent::At(set)) => SolarDay::Normal {
            sunrise_minute: to_local_minute(rise, offset_min),
            sunset_minute: to_local_minute(set, offset_min),
        },
        (SunEvent::NeverRises, _) | (_, SunEvent::NeverRises) => SolarDay::PolarNight,
        _ => SolarDay::MidnightSun,
    }
}

enum SunEvent {
    At(f64),
    NeverRises,
    NeverSets,
}

fn sun_event_utc_hours(day_of_year: f64, latitude: f64, longitude: f64, rising: bool) -> SunEvent {
    let lng_hour = longitude / 15.0;
    let approx = if rising {
        day_of_year + (6.0 - lng_hour) / 24.0
    } else {
        day_of_year + (18.0 - lng_hour) / 24.0
    };

    let mean_anomaly = 0.9856 * approx - 3.289;
    let true_longitude = normalize_degrees(
        mean_anomaly
            + 1.916 * sin_deg(mean_anomaly)
            + 0.020 * sin_deg(2.0 * mean_anomaly)
            + 282.634,
    );

    let mut right_ascension = normalize_degrees(atan_deg(0.91764 * tan_deg(true_longitude)));
    let l_quadrant = (true_longitude / 90.0).floor() * 90.0;
    let ra_quadrant = (right_ascension / 90.0).floor() * 90.0;
    right_ascension = (right_ascension + l_quadrant - ra_quadrant) / 15.0;

    let sin_dec = 0.39782 * sin_deg(true_longitude);
    let cos_dec = sin_dec.asin().cos();

    let cos_hour = (cos_deg(OFFICIAL_ZENITH_DEG) - sin_dec * sin_deg(latitude))
        / (cos_dec * cos_deg(latitude));
    if cos_hour > 1.0 {
        return SunEvent::NeverRises;
    }
    if cos_hour < -1.0 {
        return SunEvent::NeverSets;
    }

    let hour_angle_deg = if rising {
        360.0 - cos_hour.acos().to_degrees()
    } else {
        cos_hour.acos().to_degrees()
    };
    let hour_angle = hour_angle_deg / 15.0;

    let local_mean = hour_angle + right_ascension - 0.06571 * approx - 6.622;
    SunEvent::At((local_mean - lng_hour).rem_euclid(24.0))
}

fn to_local_minute(utc_hours: f64, offset_min: i32) -> u16 {
    let minute = (utc_hours * 60.0).round() as i32 + offset_min;
    minute.rem_euclid(MINUTES_PER_DAY) as u16
}

fn dark_for(day: SolarDay, minute: u16, margin: u16) -> bool {
    match day {
        SolarDay::PolarNight => true,
        SolarDay::MidnightSun => false,
        SolarDay::Normal {
            sunrise_minute,
            sunset_minute,
        } => {
            let day_length = (i32::from(sunset_minute) - i32::from(sunrise_minute))
                .rem_euclid(MINUTES_PER_DAY);
            if day_length <= 2 * i32::from(margin) {
                return true;
            }
            let light_from = (i32::from(sunrise_minute) + i32::from(margin))
                .rem_euclid(MINUTES_PER_DAY) as u16;
            let light_until = (i32::from(sunset_minute) - i32::from(margin))
                .rem_euclid(MINUTES_PER_DAY) as u16;
            !in_window(minute, light_from, light_until)
        }
    }
}

/// Half-open `[start, end)` window on the 24h dial; wraps past midnight when
/// `start > end`.
fn in_window(minute: u16, start: u16, end: u16) -> bool {
    if start <= end {
        (start..end).contains(&minute)
    } else {
        minute >= start || minute < end
    }
}

fn normalize_degrees(value: f64) -> f64 {
    value.rem_euclid(360.0)
}

fn sin_deg(value: f64) -> f64 {
    value.to_radians().sin()
}

fn cos_deg(value: f64) -> f64 {
    value.to_radians().cos()
}

fn tan_deg(value: f64) -> f64 {
    value.to_radians().tan()
}

fn atan_deg(value: f64) -> f64 {
    value.atan().to_degrees()
}
