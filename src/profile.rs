// 🕰️ Profile Resolver - Which configured sensitivity applied at a given instant
//
// Two steps:
// 1. Version selection: newest version with effective_from <= target,
//    falling back to the OLDEST version when the target predates them all.
// 2. Schedule lookup: last breakpoint <= time of day, wrapping to the last
//    breakpoint of the day when the target precedes the first one.
//
// Time of day is read in the profile's own time zone (IANA name on the
// newest version's default store), falling back to a configured fixed offset.

use crate::model::{ProfileStore, ProfileVersion};
use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use chrono_tz::Tz;

const MINUTES_PER_DAY: u32 = 24 * 60;

// ============================================================================
// TIME OF DAY
// ============================================================================

/// "HH:MM" (or "HH:MM:SS") → minutes since midnight
pub fn parse_time_of_day(raw: &str) -> Option<u32> {
    let mut parts = raw.trim().split(':');
    let hours: u32 = parts.next()?.trim().parse().ok()?;
    let minutes: u32 = match parts.next() {
        Some(m) => m.trim().parse().ok()?,
        None => 0,
    };

    if hours >= 24 || minutes >= 60 {
        return None;
    }

    Some(hours * 60 + minutes)
}

// ============================================================================
// LOCAL ZONE
// ============================================================================

/// Zone used for every time-of-day computation of one report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalZone {
    /// IANA zone, DST-aware
    Named(Tz),
    Fixed(FixedOffset),
}

impl LocalZone {
    pub fn utc() -> Self {
        LocalZone::Fixed(utc_offset())
    }

    /// `name` if it is a known IANA zone, else `fallback`
    pub fn from_name_or(name: Option<&str>, fallback: FixedOffset) -> Self {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => match name.parse::<Tz>() {
                Ok(tz) => LocalZone::Named(tz),
                Err(_) => {
                    log::warn!("Unknown profile time zone {:?}, using {}", name, fallback);
                    LocalZone::Fixed(fallback)
                }
            },
            None => LocalZone::Fixed(fallback),
        }
    }

    /// (hour, minute) of `instant` in this zone
    fn hour_minute(&self, instant: DateTime<Utc>) -> (u32, u32) {
        match self {
            LocalZone::Named(tz) => {
                let local = instant.with_timezone(tz);
                (local.hour(), local.minute())
            }
            LocalZone::Fixed(offset) => {
                let local = instant.with_timezone(offset);
                (local.hour(), local.minute())
            }
        }
    }

    pub fn hour(&self, instant: DateTime<Utc>) -> u32 {
        self.hour_minute(instant).0
    }

    /// Minutes since local midnight of `instant`
    pub fn minutes_of_day(&self, instant: DateTime<Utc>) -> u32 {
        let (hour, minute) = self.hour_minute(instant);
        hour * 60 + minute
    }
}

impl std::fmt::Display for LocalZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalZone::Named(tz) => write!(f, "{}", tz.name()),
            LocalZone::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}


/// Breakpoints of a store as `(minute, value)`, sorted ascending.
///
/// Entries with an unparsable time of day are ignored.
pub fn sorted_schedule(store: &ProfileStore) -> Vec<(u32, f64)> {
    let mut schedule: Vec<(u32, f64)> = store
        .sensitivity
        .iter()
        .filter_map(|entry| match parse_time_of_day(&entry.time_of_day) {
            Some(minute) => Some((minute, entry.value)),
            None => {
                log::warn!("Ignoring schedule entry with bad time {:?}", entry.time_of_day);
                None
            }
        })
        .collect();

    schedule.sort_by_key(|(minute, _)| *minute);
    schedule
}

/// Value active at `target_minute` of a cyclic day schedule.
///
/// Folds over the sorted breakpoints keeping the last one `<= target`; the
/// fold starts from the last breakpoint, which is what wraps early-morning
/// targets back to the previous evening's value.
pub fn lookup_schedule(schedule: &[(u32, f64)], target_minute: u32) -> Option<f64> {
    let wrap = schedule.last()?.1;
    let target = target_minute % MINUTES_PER_DAY;

    Some(
        schedule
            .iter()
            .take_while(|(minute, _)| *minute <= target)
            .last()
            .map_or(wrap, |(_, value)| *value),
    )
}

// ============================================================================
// PROFILE RESOLVER
// ============================================================================

/// Immutable, explicitly-passed set of profile versions.
pub struct ProfileResolver {
    /// Sorted by `effective_from` descending (newest first)
    versions: Vec<ProfileVersion>,

    /// Zone used to turn instants into a time of day
    zone: LocalZone,
}

impl ProfileResolver {
    /// Zone comes from the newest version's time zone, else `fallback`
    pub fn new(mut versions: Vec<ProfileVersion>, fallback: FixedOffset) -> Self {
        versions.sort_by(|a, b| b.effective_from.cmp(&a.effective_from));
        let zone = LocalZone::from_name_or(
            versions.first().and_then(|v| v.timezone.as_deref()),
            fallback,
        );
        ProfileResolver { versions, zone }
    }

    pub fn utc(versions: Vec<ProfileVersion>) -> Self {
        Self::new(versions, utc_offset())
    }

    pub fn zone(&self) -> LocalZone {
        self.zone
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Newest version already in effect at `target`; oldest if none is
    pub fn select_version(&self, target: DateTime<Utc>) -> Option<&ProfileVersion> {
        self.versions
            .iter()
            .find(|v| v.effective_from <= target)
            .or_else(|| self.versions.last())
    }

    /// Profile sensitivity at `target`, `None` if the selected version's
    /// default store is missing or has no schedule
    pub fn resolve(&self, target: DateTime<Utc>) -> Option<f64> {
        let version = self.select_version(target)?;

        let store = match version.default_store() {
            Some(store) => store,
            None => {
                log::debug!(
                    "Profile version from {} has no store named {:?}",
                    version.effective_from,
                    version.default_store_name
                );
                return None;
            }
        };

        let schedule = sorted_schedule(store);
        lookup_schedule(&schedule, self.zone.minutes_of_day(target))
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

// ============================================================================
// TESTS
// ============================================================================
