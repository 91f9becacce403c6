//! Nearby-time suggestions for when the requested slot has no table.

use std::cmp::Ordering;

use serde::Serialize;

use crate::limits::MAX_SUGGESTIONS_PER_BUCKET;
use crate::model::*;

use super::allocation::{AllocationTarget, Allocator};
use super::conflict::occupied_tables;

/// Where and how finely to look.
#[derive(Debug, Clone, Copy)]
pub struct SearchWindow {
    pub requested: Minute,
    pub duration: Minute,
    /// Furthest offset either side of `requested`.
    pub reach: Minute,
    pub step: Minute,
    /// Business hours: candidates outside `[opens, last_seating]` are skipped.
    pub opens: Minute,
    pub last_seating: Minute,
    /// Reduced durations shorter than this are not offered.
    pub min_flex: Minute,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alternative {
    /// `HH:MM`
    pub time: String,
    #[serde(skip)]
    pub minute: Minute,
    /// Negative when earlier than requested.
    pub minutes_from_requested: Minute,
    pub available_duration: Minute,
    pub score: f64,
    pub reason: String,
    pub target: AllocationTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Alternatives {
    #[serde(rename = "earlierSlots")]
    pub earlier: Vec<Alternative>,
    #[serde(rename = "laterSlots")]
    pub later: Vec<Alternative>,
    #[serde(rename = "flexibleDurations")]
    pub flexible: Vec<Alternative>,
}

impl Alternatives {
    pub fn is_empty(&self) -> bool {
        self.earlier.is_empty() && self.later.is_empty() && self.flexible.is_empty()
    }
}

/// `max(0, 100 − distance) + 50 × min(1, available / requested)`
pub fn score(distance: Minute, available: Minute, requested: Minute) -> f64 {
    let time_score = (100 - distance).max(0) as f64;
    let fit = if requested > 0 {
        (available as f64 / requested as f64).min(1.0)
    } else {
        1.0
    };
    time_score + 50.0 * fit
}

pub fn reason(distance: Minute, available: Minute, requested: Minute) -> String {
    if distance <= 15 {
        "very close to requested time".into()
    } else if distance <= 30 {
        "close to requested time".into()
    } else if available >= requested {
        "full duration available".into()
    } else {
        format!("{available} of {requested} minutes available")
    }
}

pub struct Optimizer<'a> {
    allocator: &'a Allocator<'a>,
    bookings: &'a [Booking],
    default_duration: Minute,
}

impl<'a> Optimizer<'a> {
    pub fn new(allocator: &'a Allocator<'a>, bookings: &'a [Booking], default_duration: Minute) -> Self {
        Self {
            allocator,
            bookings,
            default_duration,
        }
    }

    pub fn suggest(&self, party_size: u32, search: &SearchWindow) -> Alternatives {
        let mut found: Vec<Alternative> = Vec::new();
        for t in candidate_times(search) {
            let Some((available, target)) = self.fit_at(t, party_size, search) else {
                continue;
            };
            let offset = t - search.requested;
            found.push(Alternative {
                time: format_minute(t),
                minute: t,
                minutes_from_requested: offset,
                available_duration: available,
                score: score(offset.abs(), available, search.duration),
                reason: reason(offset.abs(), available, search.duration),
                target,
            });
        }

        // Stable: equal scores keep candidate order (nearest first, earlier before later).
        found.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let bucket = |keep: &dyn Fn(&Alternative) -> bool| -> Vec<Alternative> {
            found
                .iter()
                .filter(|a| keep(a))
                .take(MAX_SUGGESTIONS_PER_BUCKET)
                .cloned()
                .collect()
        };
        Alternatives {
            earlier: bucket(&|a| a.minute < search.requested),
            later: bucket(&|a| a.minute > search.requested),
            flexible: bucket(&|a| a.available_duration < search.duration),
        }
    }

    /// Longest duration (full, then shrinking by `step`) some table can take at `t`.
    fn fit_at(&self, t: Minute, party_size: u32, search: &SearchWindow) -> Option<(Minute, AllocationTarget)> {
        let groups = &self.allocator.floor().groups;
        let mut duration = search.duration;
        loop {
            let span = Span::starting_at(t, duration);
            let occupied = occupied_tables(self.bookings, groups, &span, self.default_duration);
            if let Some(allocation) = self.allocator.fallback(party_size, &occupied) {
                return Some((duration, allocation.target));
            }
            duration -= search.step.max(1);
            if duration < search.min_flex || duration <= 0 {
                return None;
            }
        }
    }
}

/// Offsets ±step, ±2·step, … out to `reach`, nearest first, clamped to business hours.
fn candidate_times(search: &SearchWindow) -> Vec<Minute> {
    let step = search.step.max(1);
    let mut out = Vec::new();
    let mut offset = step;
    while offset <= search.reach {
        for t in [search.requested - offset, search.requested + offset] {
            if (search.opens..=search.last_seating).contains(&t) {
                out.push(t);
            }
        }
        offset += step;
    }
    out
}
