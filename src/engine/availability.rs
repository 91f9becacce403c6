//! Per-slot availability for one service day.
//!
//! `scan_service` is pure: it takes a snapshot of the floor, the day's
//! bookings and the live holds, and reports every seating time.

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::*;

use super::conflict::occupied_tables;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySlot {
    /// `HH:MM`
    pub time: String,
    #[serde(skip)]
    pub minute: Minute,
    pub held: bool,
    /// Expiry of the hold on this slot, kept so a cached scan can age it out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_until: Option<Ms>,
    /// Active, online-bookable tables free for the whole seating.
    pub free_tables: usize,
    /// Largest party one free table or fully free join group can take.
    pub max_party_size: u32,
    pub available: bool,
}

impl AvailabilitySlot {
    fn release_hold_if_expired(&mut self, now: Ms) {
        if self.held_until.is_some_and(|until| until <= now) {
            self.held = false;
            self.held_until = None;
            self.available = self.free_tables > 0;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAvailability {
    pub venue_id: VenueId,
    pub service_id: ServiceId,
    pub date: NaiveDate,
    pub computed_at: Ms,
    pub slots: Vec<AvailabilitySlot>,
}

impl ServiceAvailability {
    /// Holds are recorded with their expiry; a cached scan re-applies the
    /// liveness test on read instead of trusting the stored flag.
    pub fn refresh_holds(&mut self, now: Ms) {
        for slot in &mut self.slots {
            slot.release_hold_if_expired(now);
        }
    }

    pub fn slot(&self, time: &str) -> Option<&AvailabilitySlot> {
        self.slots.iter().find(|s| s.time == time)
    }
}

/// Everything the scan reads, fetched by the caller.
pub struct DaySnapshot<'a> {
    pub service: &'a Service,
    pub date: NaiveDate,
    pub tables: &'a [Table],
    pub groups: &'a [JoinGroup],
    pub bookings: &'a [Booking],
    pub locks: &'a [Lock],
}

pub fn scan_service(day: &DaySnapshot<'_>, default_duration: Minute, now: Ms) -> ServiceAvailability {
    let duration = day.service.duration_minutes.unwrap_or(default_duration).max(1);
    let slots = day
        .service
        .seating_times()
        .into_iter()
        .map(|minute| {
            let span = Span::starting_at(minute, duration);
            let occupied = occupied_tables(day.bookings, day.groups, &span, default_duration);
            let free: Vec<&Table> = day
                .tables
                .iter()
                .filter(|t| t.is_active() && t.online_bookable && !occupied.contains(&t.id))
                .collect();

            let best_table = free.iter().map(|t| t.seats).max().unwrap_or(0);
            let best_group = day
                .groups
                .iter()
                .filter(|g| {
                    !g.table_ids.is_empty()
                        && g.table_ids.iter().all(|id| free.iter().any(|t| t.id == *id))
                })
                .map(|g| g.max_party)
                .max()
                .unwrap_or(0);

            let held_until = day
                .locks
                .iter()
                .find(|l| minute_of_day(l.key.time) == minute && l.is_live(now))
                .map(|l| l.expires_at);

            AvailabilitySlot {
                time: format_minute(minute),
                minute,
                held: held_until.is_some(),
                held_until,
                free_tables: free.len(),
                max_party_size: best_table.max(best_group),
                available: held_until.is_none() && !free.is_empty(),
            }
        })
        .collect();

    ServiceAvailability {
        venue_id: day.service.venue_id,
        service_id: day.service.id,
        date: day.date,
        computed_at: now,
        slots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn dinner() -> Service {
        Service {
            id: 1,
            venue_id: 1,
            name: "Dinner".into(),
            opens_at: parse_time("18:00").unwrap(),
            last_seating: parse_time("20:00").unwrap(),
            slot_interval_minutes: 60,
            duration_minutes: Some(90),
        }
    }

    fn table(id: TableId, seats: u32) -> Table {
        Table {
            id,
            venue_id: 1,
            label: format!("T{id}"),
            seats,
            section: None,
            priority_rank: 0,
            online_bookable: true,
            status: TableStatus::Active,
        }
    }

    fn day() -> NaiveDate {
        parse_date("2024-06-01").unwrap()
    }

    fn hold(time: &str, expires_at: Ms) -> Lock {
        Lock {
            token: Ulid::new(),
            key: SlotKey {
                venue_id: 1,
                service_id: 1,
                date: day(),
                time: parse_time(time).unwrap(),
            },
            party_size: 2,
            created_at: 0,
            expires_at,
            released_at: None,
            reason: None,
        }
    }

    #[test]
    fn counts_free_tables_per_seating() {
        let service = dinner();
        let tables = vec![table(1, 2), table(2, 6)];
        let bookings = vec![Booking {
            id: Ulid::new(),
            venue_id: 1,
            service_id: 1,
            table_id: Some(2),
            join_group_id: None,
            party_size: 5,
            date: day(),
            time: parse_time("18:30").unwrap(),
            duration_minutes: Some(60),
            status: BookingStatus::Confirmed,
        }];
        let snap = DaySnapshot {
            service: &service,
            date: day(),
            tables: &tables,
            groups: &[],
            bookings: &bookings,
            locks: &[],
        };
        let scan = scan_service(&snap, 120, 0);
        let times: Vec<_> = scan.slots.iter().map(|s| s.time.as_str()).collect();
        assert_eq!(times, vec!["18:00", "19:00", "20:00"]);

        // 18:00–19:30 and 19:00–20:30 both overlap 18:30–19:30.
        assert_eq!(scan.slot("18:00").unwrap().free_tables, 1);
        assert_eq!(scan.slot("19:00").unwrap().max_party_size, 2);
        let eight = scan.slot("20:00").unwrap();
        assert_eq!(eight.free_tables, 2);
        assert_eq!(eight.max_party_size, 6);
        assert!(eight.available);
    }

    #[test]
    fn join_group_raises_max_party() {
        let service = dinner();
        let tables = vec![table(1, 4), table(2, 4)];
        let groups = vec![JoinGroup {
            id: 5,
            venue_id: 1,
            name: "Long table".into(),
            table_ids: vec![1, 2],
            min_party: 6,
            max_party: 8,
        }];
        let snap = DaySnapshot {
            service: &service,
            date: day(),
            tables: &tables,
            groups: &groups,
            bookings: &[],
            locks: &[],
        };
        assert_eq!(scan_service(&snap, 120, 0).slots[0].max_party_size, 8);
    }

    #[test]
    fn non_positive_service_duration_scans_as_one_minute() {
        let service = Service {
            duration_minutes: Some(0),
            ..dinner()
        };
        let tables = vec![table(1, 4)];
        let bookings = vec![Booking {
            id: Ulid::new(),
            venue_id: 1,
            service_id: 1,
            table_id: Some(1),
            join_group_id: None,
            party_size: 4,
            date: day(),
            time: parse_time("19:00").unwrap(),
            duration_minutes: Some(30),
            status: BookingStatus::Confirmed,
        }];
        let snap = DaySnapshot {
            service: &service,
            date: day(),
            tables: &tables,
            groups: &[],
            bookings: &bookings,
            locks: &[],
        };
        let scan = scan_service(&snap, 120, 0);
        assert!(scan.slot("18:00").unwrap().available);
        assert!(!scan.slot("19:00").unwrap().available);
        assert!(scan.slot("20:00").unwrap().available);

        let negative = Service {
            duration_minutes: Some(-15),
            ..dinner()
        };
        let snap = DaySnapshot {
            service: &negative,
            ..snap
        };
        assert_eq!(scan_service(&snap, 120, 0).slots.len(), 3);
    }

    #[test]
    fn offline_and_inactive_tables_are_not_counted() {
        let service = dinner();
        let mut phone = table(1, 4);
        phone.online_bookable = false;
        let mut closed = table(2, 4);
        closed.status = TableStatus::Inactive;
        let tables = vec![phone, closed];
        let snap = DaySnapshot {
            service: &service,
            date: day(),
            tables: &tables,
            groups: &[],
            bookings: &[],
            locks: &[],
        };
        let scan = scan_service(&snap, 120, 0);
        assert!(scan.slots.iter().all(|s| s.free_tables == 0 && !s.available));
    }

    #[test]
    fn live_hold_marks_slot_and_ages_out_of_cached_copy() {
        let service = dinner();
        let tables = vec![table(1, 4)];
        let locks = vec![hold("19:00", 1000), hold("20:00", 50)];
        let snap = DaySnapshot {
            service: &service,
            date: day(),
            tables: &tables,
            groups: &[],
            bookings: &[],
            locks: &locks,
        };
        let mut scan = scan_service(&snap, 120, 100);
        let seven = scan.slot("19:00").unwrap();
        assert!(seven.held);
        assert!(!seven.available);
        assert_eq!(seven.held_until, Some(1000));
        // Already expired when scanned.
        assert!(!scan.slot("20:00").unwrap().held);

        scan.refresh_holds(1000);
        let seven = scan.slot("19:00").unwrap();
        assert!(!seven.held);
        assert!(seven.available);
    }
}
