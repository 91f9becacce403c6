use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_party_size(party_size: u32) -> Result<(), EngineError> {
    if party_size == 0 {
        return Err(EngineError::InvalidRequest("partySize must be at least 1".into()));
    }
    if party_size > MAX_PARTY_SIZE {
        return Err(EngineError::LimitExceeded("party too large"));
    }
    Ok(())
}

pub(crate) fn validate_duration(duration: Minute) -> Result<(), EngineError> {
    if duration <= 0 {
        return Err(EngineError::InvalidRequest("duration must be positive".into()));
    }
    if duration > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(())
}

pub(crate) fn validate_slug(slug: &str) -> Result<(), EngineError> {
    if slug.trim().is_empty() {
        return Err(EngineError::InvalidRequest("venueSlug is required".into()));
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(EngineError::LimitExceeded("venueSlug too long"));
    }
    Ok(())
}

pub(crate) fn parse_slot(date: &str, time: &str) -> Result<(NaiveDate, NaiveTime), EngineError> {
    let d = parse_date(date)
        .ok_or_else(|| EngineError::InvalidRequest(format!("invalid date: {date}")))?;
    let t = parse_time(time)
        .ok_or_else(|| EngineError::InvalidRequest(format!("invalid time: {time}")))?;
    Ok((d, t))
}

/// Tables a booking sits at: its own table plus every member of its join group.
pub fn claimed_tables(booking: &Booking, groups: &[JoinGroup]) -> Vec<TableId> {
    let mut ids: Vec<TableId> = booking.table_id.into_iter().collect();
    if let Some(gid) = booking.join_group_id
        && let Some(group) = groups.iter().find(|g| g.id == gid)
    {
        ids.extend(group.table_ids.iter().copied());
    }
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Tables claimed by any non-terminal booking whose interval overlaps `span`.
/// `bookings` must already be restricted to the day in question.
pub fn occupied_tables(
    bookings: &[Booking],
    groups: &[JoinGroup],
    span: &Span,
    default_duration: Minute,
) -> HashSet<TableId> {
    let mut occupied = HashSet::new();
    for booking in bookings {
        if !booking.status.occupies_table() {
            continue;
        }
        if booking.span(default_duration).overlaps(span) {
            occupied.extend(claimed_tables(booking, groups));
        }
    }
    occupied
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn booking(table: Option<TableId>, group: Option<GroupId>, time: &str, duration: Option<Minute>, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            venue_id: 1,
            service_id: 1,
            table_id: table,
            join_group_id: group,
            party_size: 2,
            date: parse_date("2024-06-01").unwrap(),
            time: parse_time(time).unwrap(),
            duration_minutes: duration,
            status,
        }
    }

    fn seven_to_nine() -> Span {
        Span::starting_at(19 * 60, 120)
    }

    #[test]
    fn overlapping_booking_occupies_its_table() {
        let bookings = vec![booking(Some(1), None, "18:30", Some(90), BookingStatus::Confirmed)];
        let occ = occupied_tables(&bookings, &[], &seven_to_nine(), 120);
        assert!(occ.contains(&1));
    }

    #[test]
    fn adjacent_booking_does_not_occupy() {
        let bookings = vec![
            booking(Some(1), None, "17:00", Some(120), BookingStatus::Confirmed),
            booking(Some(2), None, "21:00", Some(60), BookingStatus::Confirmed),
        ];
        let occ = occupied_tables(&bookings, &[], &seven_to_nine(), 120);
        assert!(occ.is_empty());
    }

    #[test]
    fn missing_duration_uses_default() {
        // 17:30 + default 120 = 19:30, overlapping 19:00.
        let bookings = vec![booking(Some(1), None, "17:30", None, BookingStatus::Seated)];
        assert!(occupied_tables(&bookings, &[], &seven_to_nine(), 120).contains(&1));
        // With a 60 minute default it ends at 18:30.
        assert!(occupied_tables(&bookings, &[], &seven_to_nine(), 60).is_empty());
    }

    #[test]
    fn cancelled_and_finished_are_ignored() {
        let bookings = vec![
            booking(Some(1), None, "19:00", Some(120), BookingStatus::Cancelled),
            booking(Some(2), None, "19:00", Some(120), BookingStatus::Finished),
            booking(Some(3), None, "19:00", Some(120), BookingStatus::PendingPayment),
        ];
        let occ = occupied_tables(&bookings, &[], &seven_to_nine(), 120);
        assert_eq!(occ, HashSet::from([3]));
    }

    #[test]
    fn group_booking_occupies_all_members() {
        let groups = vec![JoinGroup {
            id: 9,
            venue_id: 1,
            name: "Patio".into(),
            table_ids: vec![4, 5, 6],
            min_party: 6,
            max_party: 10,
        }];
        let bookings = vec![booking(None, Some(9), "19:30", Some(60), BookingStatus::Confirmed)];
        let occ = occupied_tables(&bookings, &groups, &seven_to_nine(), 120);
        assert_eq!(occ, HashSet::from([4, 5, 6]));
    }

    #[test]
    fn unassigned_booking_occupies_nothing() {
        let bookings = vec![booking(None, None, "19:00", Some(120), BookingStatus::Pending)];
        assert!(occupied_tables(&bookings, &[], &seven_to_nine(), 120).is_empty());
    }

    #[test]
    fn slot_parsing_reports_which_field() {
        assert!(parse_slot("2024-06-01", "19:00").is_ok());
        let err = parse_slot("06/01/2024", "19:00").unwrap_err();
        assert!(err.to_string().contains("invalid date"));
        let err = parse_slot("2024-06-01", "noon").unwrap_err();
        assert!(err.to_string().contains("invalid time"));
    }

    #[test]
    fn party_size_bounds() {
        assert!(validate_party_size(1).is_ok());
        assert!(matches!(validate_party_size(0), Err(EngineError::InvalidRequest(_))));
        assert!(matches!(
            validate_party_size(MAX_PARTY_SIZE + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
