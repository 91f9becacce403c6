//! Table selection for one party at one interval.
//!
//! Pure decision over a floor snapshot and an occupied-table set; the caller
//! persists whatever it picks.

use std::collections::HashSet;

use serde::Serialize;

use crate::model::*;

/// A venue's floor as read for one decision.
#[derive(Debug, Clone, Default)]
pub struct FloorPlan {
    pub tables: Vec<Table>,
    pub groups: Vec<JoinGroup>,
    /// Preferences for the party size being allocated.
    pub priorities: PriorityList,
}

impl FloorPlan {
    fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == id)
    }

    fn group(&self, id: GroupId) -> Option<&JoinGroup> {
        self.groups.iter().find(|g| g.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationTarget {
    Table {
        id: TableId,
        label: String,
        seats: u32,
    },
    Group {
        id: GroupId,
        name: String,
        #[serde(rename = "tableIds")]
        table_ids: Vec<TableId>,
    },
}

impl AllocationTarget {
    fn table(t: &Table) -> Self {
        AllocationTarget::Table {
            id: t.id,
            label: t.label.clone(),
            seats: t.seats,
        }
    }

    fn group(g: &JoinGroup) -> Self {
        AllocationTarget::Group {
            id: g.id,
            name: g.name.clone(),
            table_ids: g.table_ids.clone(),
        }
    }

    /// `(table_id, join_group_id)` as stored on a booking row. A group
    /// booking points its table reference at the first member.
    pub fn booking_refs(&self) -> (Option<TableId>, Option<GroupId>) {
        match self {
            AllocationTarget::Table { id, .. } => (Some(*id), None),
            AllocationTarget::Group { id, table_ids, .. } => (table_ids.first().copied(), Some(*id)),
        }
    }
}

/// Which step of the search produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPass {
    Priority,
    JoinGroup,
    Efficiency,
}

impl AllocationPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationPass::Priority => "priority",
            AllocationPass::JoinGroup => "join_group",
            AllocationPass::Efficiency => "efficiency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    pub target: AllocationTarget,
    pub pass: AllocationPass,
    /// party size / seats at the chosen table or group.
    pub efficiency: f64,
}

pub struct Allocator<'a> {
    floor: &'a FloorPlan,
    large_party: u32,
    /// Online requests may only land on online-bookable tables.
    online_only: bool,
}

impl<'a> Allocator<'a> {
    pub fn new(floor: &'a FloorPlan, large_party: u32, online_only: bool) -> Self {
        Self {
            floor,
            large_party,
            online_only,
        }
    }

    pub fn floor(&self) -> &'a FloorPlan {
        self.floor
    }

    /// Operator priorities first, then the generic fallback.
    pub fn allocate(&self, party_size: u32, occupied: &HashSet<TableId>) -> Option<Allocation> {
        self.by_priority(party_size, occupied)
            .or_else(|| self.fallback(party_size, occupied))
    }

    /// Walk the priority list in rank order; first acceptable entry wins.
    pub fn by_priority(&self, party_size: u32, occupied: &HashSet<TableId>) -> Option<Allocation> {
        self.floor.priorities.iter().find_map(|entry| {
            match entry.target {
                PriorityTarget::Table(id) => self
                    .floor
                    .table(id)
                    .filter(|t| self.table_fits(t, party_size, occupied))
                    .map(|t| self.with_table(t, party_size, AllocationPass::Priority)),
                PriorityTarget::Group(id) => self
                    .floor
                    .group(id)
                    .filter(|g| self.group_fits(g, party_size, occupied))
                    .map(|g| self.with_group(g, party_size, AllocationPass::Priority)),
            }
        })
    }

    /// Large parties try join groups first; everyone else (and large parties
    /// no group can take) gets the tightest single table.
    pub fn fallback(&self, party_size: u32, occupied: &HashSet<TableId>) -> Option<Allocation> {
        if party_size >= self.large_party
            && let Some(group) = self
                .floor
                .groups
                .iter()
                .find(|g| self.group_fits(g, party_size, occupied))
        {
            return Some(self.with_group(group, party_size, AllocationPass::JoinGroup));
        }

        // Efficiency is party_size / seats, so for a fixed party the most
        // efficient table is the one with the fewest seats.
        self.floor
            .tables
            .iter()
            .filter(|t| self.table_fits(t, party_size, occupied))
            .min_by_key(|t| (t.seats, t.priority_rank))
            .map(|t| self.with_table(t, party_size, AllocationPass::Efficiency))
    }

    fn with_table(&self, table: &Table, party_size: u32, pass: AllocationPass) -> Allocation {
        Allocation {
            target: AllocationTarget::table(table),
            pass,
            efficiency: efficiency(party_size, table.seats),
        }
    }

    fn with_group(&self, group: &JoinGroup, party_size: u32, pass: AllocationPass) -> Allocation {
        let seats = group
            .table_ids
            .iter()
            .filter_map(|id| self.floor.table(*id))
            .map(|t| t.seats)
            .sum();
        Allocation {
            target: AllocationTarget::group(group),
            pass,
            efficiency: efficiency(party_size, seats),
        }
    }

    fn usable(&self, table: &Table) -> bool {
        table.is_active() && (!self.online_only || table.online_bookable)
    }

    fn table_fits(&self, table: &Table, party_size: u32, occupied: &HashSet<TableId>) -> bool {
        self.usable(table) && table.seats >= party_size && !occupied.contains(&table.id)
    }

    fn group_fits(&self, group: &JoinGroup, party_size: u32, occupied: &HashSet<TableId>) -> bool {
        group.seats(party_size)
            && !group.table_ids.is_empty()
            && group.table_ids.iter().all(|id| {
                !occupied.contains(id) && self.floor.table(*id).is_some_and(|t| self.usable(t))
            })
    }
}

pub fn efficiency(party_size: u32, seats: u32) -> f64 {
    if seats == 0 {
        return 0.0;
    }
    party_size as f64 / seats as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::occupied_tables;
    use ulid::Ulid;

    fn table(id: TableId, seats: u32, rank: i32) -> Table {
        Table {
            id,
            venue_id: 1,
            label: format!("T{id}"),
            seats,
            section: None,
            priority_rank: rank,
            online_bookable: true,
            status: TableStatus::Active,
        }
    }

    fn group(id: GroupId, members: &[TableId], min: u32, max: u32) -> JoinGroup {
        JoinGroup {
            id,
            venue_id: 1,
            name: format!("G{id}"),
            table_ids: members.to_vec(),
            min_party: min,
            max_party: max,
        }
    }

    fn booked(table: TableId, time: &str, duration: Minute) -> Booking {
        Booking {
            id: Ulid::new(),
            venue_id: 1,
            service_id: 1,
            table_id: Some(table),
            join_group_id: None,
            party_size: 2,
            date: parse_date("2024-06-01").unwrap(),
            time: parse_time(time).unwrap(),
            duration_minutes: Some(duration),
            status: BookingStatus::Confirmed,
        }
    }

    fn chosen_table(a: &Option<Allocation>) -> Option<TableId> {
        match a.as_ref()?.target {
            AllocationTarget::Table { id, .. } => Some(id),
            AllocationTarget::Group { .. } => None,
        }
    }

    fn chosen_group(a: &Option<Allocation>) -> Option<GroupId> {
        match a.as_ref()?.target {
            AllocationTarget::Group { id, .. } => Some(id),
            AllocationTarget::Table { .. } => None,
        }
    }

    #[test]
    fn tightest_free_table_wins_then_next_when_booked() {
        let floor = FloorPlan {
            tables: vec![table(1, 4, 1), table(2, 6, 2)],
            ..Default::default()
        };
        let alloc = Allocator::new(&floor, 7, false);
        let request = Span::starting_at(19 * 60, 120);

        let none = occupied_tables(&[], &floor.groups, &request, 120);
        let a = alloc.allocate(4, &none);
        assert_eq!(chosen_table(&a), Some(1));
        let a = a.unwrap();
        assert_eq!(a.pass, AllocationPass::Efficiency);
        assert_eq!(a.efficiency, 1.0);

        // Table A booked 18:30–20:00 overlaps 19:00–21:00.
        let bookings = vec![booked(1, "18:30", 90)];
        let occ = occupied_tables(&bookings, &floor.groups, &request, 120);
        assert_eq!(chosen_table(&alloc.allocate(4, &occ)), Some(2));
    }

    #[test]
    fn equal_seats_break_tie_on_rank() {
        let floor = FloorPlan {
            tables: vec![table(1, 4, 5), table(2, 4, 2), table(3, 4, 9)],
            ..Default::default()
        };
        let a = Allocator::new(&floor, 7, false).allocate(3, &HashSet::new());
        assert_eq!(chosen_table(&a), Some(2));
    }

    #[test]
    fn priority_list_beats_efficiency() {
        let floor = FloorPlan {
            tables: vec![table(1, 2, 1), table(2, 6, 2)],
            groups: vec![],
            priorities: PriorityList::new(vec![PriorityEntry {
                rank: 1,
                target: PriorityTarget::Table(2),
            }]),
        };
        let a = Allocator::new(&floor, 7, false).allocate(2, &HashSet::new());
        assert_eq!(chosen_table(&a), Some(2));
        assert_eq!(a.unwrap().pass, AllocationPass::Priority);
    }

    #[test]
    fn priority_skips_unfit_entries_in_rank_order() {
        let floor = FloorPlan {
            tables: vec![table(1, 2, 1), table(2, 4, 1), table(3, 4, 1), table(4, 4, 1)],
            groups: vec![group(10, &[3, 4], 6, 8)],
            priorities: PriorityList::new(vec![
                PriorityEntry { rank: 3, target: PriorityTarget::Table(3) },
                PriorityEntry { rank: 1, target: PriorityTarget::Table(1) }, // too small
                PriorityEntry { rank: 2, target: PriorityTarget::Group(10) }, // party out of range
                PriorityEntry { rank: 0, target: PriorityTarget::Table(2) },  // occupied
            ]),
        };
        let occupied = HashSet::from([2]);
        let a = Allocator::new(&floor, 7, false).allocate(4, &occupied);
        assert_eq!(chosen_table(&a), Some(3));
    }

    #[test]
    fn priority_group_needs_every_member_free() {
        let floor = FloorPlan {
            tables: vec![table(1, 4, 1), table(2, 4, 1), table(3, 8, 5)],
            groups: vec![group(10, &[1, 2], 5, 8)],
            priorities: PriorityList::new(vec![PriorityEntry {
                rank: 1,
                target: PriorityTarget::Group(10),
            }]),
        };
        let alloc = Allocator::new(&floor, 7, false);
        let a = alloc.allocate(6, &HashSet::new());
        assert_eq!(chosen_group(&a), Some(10));

        let a = alloc.allocate(6, &HashSet::from([2]));
        assert_eq!(chosen_table(&a), Some(3));
        assert_eq!(a.unwrap().pass, AllocationPass::Efficiency);
    }

    #[test]
    fn large_party_prefers_join_group() {
        let floor = FloorPlan {
            tables: vec![table(1, 4, 1), table(2, 4, 1), table(3, 10, 1)],
            groups: vec![group(10, &[1, 2], 7, 8)],
            priorities: PriorityList::default(),
        };
        let a = Allocator::new(&floor, 7, false).allocate(8, &HashSet::new());
        assert_eq!(chosen_group(&a), Some(10));
        assert_eq!(a.unwrap().pass, AllocationPass::JoinGroup);
    }

    #[test]
    fn small_party_ignores_groups_in_fallback() {
        let floor = FloorPlan {
            tables: vec![table(1, 4, 1), table(2, 4, 1)],
            groups: vec![group(10, &[1, 2], 5, 8)],
            priorities: PriorityList::default(),
        };
        // Party of 5 is below the large-party threshold and no single table seats 5.
        let a = Allocator::new(&floor, 7, false).allocate(5, &HashSet::new());
        assert!(a.is_none());
    }

    #[test]
    fn large_party_falls_back_to_single_table() {
        let floor = FloorPlan {
            tables: vec![table(1, 4, 1), table(2, 4, 1), table(3, 12, 1)],
            groups: vec![group(10, &[1, 2], 7, 8)],
            priorities: PriorityList::default(),
        };
        let a = Allocator::new(&floor, 7, false).allocate(9, &HashSet::new());
        assert_eq!(chosen_table(&a), Some(3));
    }

    #[test]
    fn party_outside_every_group_and_table_fails() {
        let floor = FloorPlan {
            tables: vec![table(1, 4, 1), table(2, 4, 1)],
            groups: vec![group(10, &[1, 2], 6, 8)],
            priorities: PriorityList::default(),
        };
        assert!(Allocator::new(&floor, 7, false).allocate(9, &HashSet::new()).is_none());
    }

    #[test]
    fn inactive_and_offline_tables_are_skipped() {
        let mut inactive = table(1, 2, 1);
        inactive.status = TableStatus::Inactive;
        let mut phone_only = table(2, 2, 1);
        phone_only.online_bookable = false;
        let floor = FloorPlan {
            tables: vec![inactive, phone_only, table(3, 6, 1)],
            ..Default::default()
        };
        let online = Allocator::new(&floor, 7, true).allocate(2, &HashSet::new());
        assert_eq!(chosen_table(&online), Some(3));
        let walk_in = Allocator::new(&floor, 7, false).allocate(2, &HashSet::new());
        assert_eq!(chosen_table(&walk_in), Some(2));
    }

    #[test]
    fn group_refs_point_at_first_member() {
        let g = group(10, &[4, 5], 5, 8);
        assert_eq!(AllocationTarget::group(&g).booking_refs(), (Some(4), Some(10)));
        let t = table(3, 4, 1);
        assert_eq!(AllocationTarget::table(&t).booking_refs(), (Some(3), None));
    }

    #[test]
    fn efficiency_ratio() {
        assert_eq!(efficiency(4, 4), 1.0);
        assert_eq!(efficiency(3, 6), 0.5);
        assert_eq!(efficiency(3, 0), 0.0);
    }
}
