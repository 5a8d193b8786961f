use crate::domain::date_range::DateRange;
use crate::domain::models::{AddResult, BlockedDay, CalendarClaim, CalendarId, DayStatus};
use chrono::NaiveDate;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Rows written and dates deleted by one store mutation, in the shape the
/// persistence layer applies them: `removed` first, then `added` as upserts.
/// `claimed` and `released` carry the calendar claims behind synced days.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreChange {
    pub added: Vec<BlockedDay>,
    pub removed: Vec<NaiveDate>,
    pub claimed: Vec<CalendarClaim>,
    pub released: Vec<(CalendarId, NaiveDate)>,
}

impl StoreChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && !self.touches_claims()
    }

    pub fn touches_claims(&self) -> bool {
        !self.claimed.is_empty() || !self.released.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub result: AddResult,
    pub change: StoreChange,
}

/// Blocked calendar days of a single property, keyed by date.
///
/// A visible day is resolved from at most one manual entry plus any number of
/// calendar claims. The manual entry owns the day when present, otherwise one of
/// the claiming calendars does. Check-in and check-out flags are the union over
/// everything that holds the day.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedDateStore {
    days: BTreeMap<NaiveDate, BlockedDay>,
    manual: BTreeMap<NaiveDate, BlockedDay>,
    claims: BTreeMap<NaiveDate, BTreeMap<CalendarId, CalendarClaim>>,
}

impl BlockedDateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_days(days: impl IntoIterator<Item = BlockedDay>) -> Self {
        Self::restore(days, Vec::new())
    }

    /// Rebuilds a store from persisted rows and claims. A synced row without a
    /// matching claim counts as a claim of its source calendar, and the row's
    /// owner keeps the day. Should two manual rows share a date, the later one wins
    /// and the check-in/check-out flags of both are kept.
    pub fn restore(
        days: impl IntoIterator<Item = BlockedDay>,
        claims: impl IntoIterator<Item = CalendarClaim>,
    ) -> Self {
        let mut store = Self::new();
        for claim in claims {
            store
                .claims
                .entry(claim.date)
                .or_default()
                .insert(claim.calendar_id, claim);
        }

        let mut owners = BTreeMap::new();
        for day in days {
            match day.source_calendar_id {
                None => store.upsert_manual_merging_flags(day),
                Some(calendar_id) => {
                    store
                        .claims
                        .entry(day.date)
                        .or_default()
                        .entry(calendar_id)
                        .or_insert_with(|| CalendarClaim::from_day(calendar_id, &day));
                    owners.insert(day.date, calendar_id);
                }
            }
        }

        let dates: BTreeSet<NaiveDate> =
            store.manual.keys().chain(store.claims.keys()).copied().collect();
        for date in dates {
            if let Some(day) = store.resolve(date, owners.get(&date).copied()) {
                store.days.insert(date, day);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&BlockedDay> {
        self.days.get(&date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    /// Days in ascending date order.
    pub fn iter(&self) -> impl Iterator<Item = &BlockedDay> {
        self.days.values()
    }

    pub fn status(&self, date: NaiveDate) -> DayStatus {
        self.days.get(&date).map(DayStatus::from).unwrap_or_default()
    }

    /// Dates `calendar_id` currently claims, whether or not it owns them.
    pub fn days_from_calendar(&self, calendar_id: CalendarId) -> Vec<NaiveDate> {
        self.claims
            .iter()
            .filter(|(_, claims)| claims.contains_key(&calendar_id))
            .map(|(date, _)| *date)
            .collect()
    }

    pub fn conflicts_with(&self, dates: impl IntoIterator<Item = NaiveDate>) -> Vec<NaiveDate> {
        dates
            .into_iter()
            .filter(|date| self.days.contains_key(date))
            .collect()
    }

    /// Blocks every day of `range`, marking the first as check-in and the last as
    /// check-out.
    pub fn add_period(
        &mut self,
        range: DateRange,
        reason: Option<String>,
        force: bool,
    ) -> AddOutcome {
        let start = range.start();
        let end = range.end();
        let days = range
            .days()
            .map(|date| BlockedDay {
                date,
                reason: reason.clone(),
                is_check_in: date == start,
                is_check_out: date == end,
                source_calendar_id: None,
            })
            .collect();
        self.write_manual_days(days, force)
    }

    pub fn add_days(&mut self, dates: &[NaiveDate], reason: Option<String>, force: bool) -> AddOutcome {
        let unique: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        let days = unique
            .into_iter()
            .map(|date| BlockedDay::manual(date, reason.clone()))
            .collect();
        self.write_manual_days(days, force)
    }

    /// Deletes the given dates together with every calendar claim on them, so a
    /// removed day stays free until a calendar syncs it again. Dates that are not
    /// blocked are ignored.
    pub fn remove_dates(&mut self, dates: &[NaiveDate]) -> StoreChange {
        let mut change = StoreChange::default();
        for date in dates {
            self.manual.remove(date);
            if let Some(claims) = self.claims.remove(date) {
                change
                    .released
                    .extend(claims.into_keys().map(|calendar_id| (calendar_id, *date)));
            }
            if self.days.remove(date).is_some() {
                change.removed.push(*date);
            }
        }
        change
    }

    pub fn remove_calendar_days(&mut self, calendar_id: CalendarId) -> StoreChange {
        self.replace_calendar_days(calendar_id, Vec::new())
    }

    /// Swaps the claims of `calendar_id` for `days` and re-resolves every date
    /// either set covers.
    ///
    /// A day shared with a manual entry or another calendar keeps that owner. When
    /// the owning calendar lets go, the day passes to a remaining claimant, and the
    /// flags it contributed disappear with its claim.
    pub fn replace_calendar_days(
        &mut self,
        calendar_id: CalendarId,
        days: Vec<BlockedDay>,
    ) -> StoreChange {
        let mut incoming: BTreeMap<NaiveDate, CalendarClaim> = BTreeMap::new();
        for day in days {
            let claim = CalendarClaim::from_day(calendar_id, &day);
            match incoming.entry(day.date) {
                Entry::Occupied(mut existing) => {
                    let existing = existing.get_mut();
                    existing.is_check_in |= claim.is_check_in;
                    existing.is_check_out |= claim.is_check_out;
                }
                Entry::Vacant(slot) => {
                    slot.insert(claim);
                }
            }
        }

        let mut change = StoreChange::default();
        let mut touched = BTreeSet::new();
        for date in self.days_from_calendar(calendar_id) {
            if !incoming.contains_key(&date) {
                self.release(calendar_id, date);
                change.released.push((calendar_id, date));
            }
            touched.insert(date);
        }
        for (date, claim) in incoming {
            change.claimed.push(claim.clone());
            self.claims.entry(date).or_default().insert(calendar_id, claim);
            touched.insert(date);
        }

        self.refresh(touched, &mut change);
        change
    }

    fn write_manual_days(&mut self, days: Vec<BlockedDay>, force: bool) -> AddOutcome {
        let conflicts = self.conflicts_with(days.iter().map(|day| day.date));
        if !conflicts.is_empty() && !force {
            return AddOutcome {
                result: AddResult::Conflict { dates: conflicts },
                change: StoreChange::default(),
            };
        }

        let mut change = self.remove_dates(&conflicts);
        let mut written = Vec::with_capacity(days.len());
        for day in days {
            written.push(day.date);
            self.manual.insert(day.date, day);
        }
        self.refresh(written.iter().copied(), &mut change);

        AddOutcome {
            result: AddResult::Committed { dates: written },
            change,
        }
    }

    fn release(&mut self, calendar_id: CalendarId, date: NaiveDate) {
        if let Some(claims) = self.claims.get_mut(&date) {
            claims.remove(&calendar_id);
            if claims.is_empty() {
                self.claims.remove(&date);
            }
        }
    }

    /// Re-resolves `dates` and records every visible row that changed.
    fn refresh(&mut self, dates: impl IntoIterator<Item = NaiveDate>, change: &mut StoreChange) {
        for date in dates {
            let owner = self.days.get(&date).and_then(|day| day.source_calendar_id);
            match self.resolve(date, owner) {
                Some(day) if self.days.get(&date) == Some(&day) => {}
                Some(day) => {
                    change.added.push(day.clone());
                    self.days.insert(date, day);
                }
                None => {
                    if self.days.remove(&date).is_some() {
                        change.removed.push(date);
                    }
                }
            }
        }
    }

    fn resolve(&self, date: NaiveDate, preferred_owner: Option<CalendarId>) -> Option<BlockedDay> {
        let claims = self.claims.get(&date);
        let (claimed_in, claimed_out) = claims
            .map(|claims| {
                claims.values().fold((false, false), |(check_in, check_out), claim| {
                    (check_in || claim.is_check_in, check_out || claim.is_check_out)
                })
            })
            .unwrap_or_default();

        if let Some(manual) = self.manual.get(&date) {
            return Some(BlockedDay {
                is_check_in: manual.is_check_in || claimed_in,
                is_check_out: manual.is_check_out || claimed_out,
                ..manual.clone()
            });
        }

        let claims = claims?;
        let owner = preferred_owner
            .and_then(|calendar_id| claims.get(&calendar_id))
            .or_else(|| claims.values().next())?;
        Some(BlockedDay {
            date,
            reason: owner.reason.clone(),
            is_check_in: claimed_in,
            is_check_out: claimed_out,
            source_calendar_id: Some(owner.calendar_id),
        })
    }

    fn upsert_manual_merging_flags(&mut self, day: BlockedDay) {
        match self.manual.get_mut(&day.date) {
            Some(existing) => {
                let is_check_in = existing.is_check_in || day.is_check_in;
                let is_check_out = existing.is_check_out || day.is_check_out;
                *existing = BlockedDay {
                    is_check_in,
                    is_check_out,
                    ..day
                };
            }
            None => {
                self.manual.insert(day.date, day);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn range(start: &str, end: &str) -> DateRange {
        DateRange::new(date(start), date(end)).expect("valid range")
    }

    fn synced(value: &str, reason: &str) -> BlockedDay {
        BlockedDay {
            date: date(value),
            reason: Some(reason.to_string()),
            is_check_in: false,
            is_check_out: false,
            source_calendar_id: None,
        }
    }

    #[test]
    fn add_period_blocks_every_day_with_markers() {
        let mut store = BlockedDateStore::new();
        let outcome = store.add_period(range("2024-06-01", "2024-06-03"), Some("Owner".into()), false);

        assert_eq!(
            outcome.result,
            AddResult::Committed {
                dates: vec![date("2024-06-01"), date("2024-06-02"), date("2024-06-03")]
            }
        );
        assert_eq!(outcome.change.added.len(), 3);
        assert!(outcome.change.removed.is_empty());
        assert!(store.status(date("2024-06-01")).check_in);
        assert!(!store.status(date("2024-06-02")).check_in);
        assert!(store.status(date("2024-06-03")).check_out);
    }

    #[test]
    fn single_day_period_is_both_check_in_and_check_out() {
        let mut store = BlockedDateStore::new();
        store.add_period(DateRange::single(date("2024-06-01")), None, false);
        let status = store.status(date("2024-06-01"));
        assert_eq!(store.len(), 1);
        assert!(status.blocked && status.check_in && status.check_out);
    }

    #[test]
    fn repeated_period_reports_conflict_and_leaves_store_unchanged() {
        let mut store = BlockedDateStore::new();
        store.add_period(range("2024-06-01", "2024-06-04"), Some("x".into()), false);
        let before = store.clone();

        let outcome = store.add_period(range("2024-06-01", "2024-06-04"), Some("x".into()), false);

        assert_eq!(
            outcome.result,
            AddResult::Conflict {
                dates: range("2024-06-01", "2024-06-04").days().collect()
            }
        );
        assert!(outcome.change.is_empty());
        assert_eq!(store, before);
    }

    #[test]
    fn forced_period_replaces_prior_days_without_residue() {
        let mut store = BlockedDateStore::new();
        store.add_period(range("2024-06-01", "2024-06-05"), Some("old".into()), false);

        let outcome = store.add_period(range("2024-06-03", "2024-06-07"), Some("new".into()), true);

        assert!(!outcome.result.is_conflict());
        assert_eq!(outcome.change.removed, vec![date("2024-06-03"), date("2024-06-04"), date("2024-06-05")]);
        for day in range("2024-06-03", "2024-06-07").days() {
            let status = store.status(day);
            assert_eq!(status.reason.as_deref(), Some("new"));
        }
        assert!(store.status(date("2024-06-03")).check_in);
        assert!(!store.status(date("2024-06-05")).check_out);
        assert_eq!(store.status(date("2024-06-02")).reason.as_deref(), Some("old"));
        assert_eq!(store.len(), 7);
    }

    #[test]
    fn add_days_deduplicates_and_detects_conflicts() {
        let mut store = BlockedDateStore::new();
        let outcome = store.add_days(
            &[date("2024-06-10"), date("2024-06-12"), date("2024-06-10")],
            None,
            false,
        );
        assert_eq!(outcome.result.dates(), &[date("2024-06-10"), date("2024-06-12")]);

        let conflict = store.add_days(&[date("2024-06-11"), date("2024-06-12")], None, false);
        assert_eq!(conflict.result, AddResult::Conflict { dates: vec![date("2024-06-12")] });
        assert!(!store.contains(date("2024-06-11")));
    }

    #[test]
    fn remove_dates_is_idempotent() {
        let mut store = BlockedDateStore::new();
        store.add_days(&[date("2024-06-10")], None, false);

        let first = store.remove_dates(&[date("2024-06-10"), date("2024-06-11")]);
        let second = store.remove_dates(&[date("2024-06-10")]);

        assert_eq!(first.removed, vec![date("2024-06-10")]);
        assert!(second.is_empty());
        assert!(!store.status(date("2024-06-10")).blocked);
    }

    #[test]
    fn replace_calendar_days_drops_stale_days_of_that_calendar_only() {
        let mut store = BlockedDateStore::new();
        store.add_days(&[date("2024-06-01")], Some("Manual".into()), false);
        store.replace_calendar_days(1, vec![synced("2024-06-10", "Airbnb"), synced("2024-06-11", "Airbnb")]);
        store.replace_calendar_days(2, vec![synced("2024-06-20", "Booking")]);

        let change = store.replace_calendar_days(1, vec![synced("2024-06-15", "Airbnb")]);

        assert_eq!(change.removed, vec![date("2024-06-10"), date("2024-06-11")]);
        assert_eq!(change.added.len(), 1);
        assert!(store.contains(date("2024-06-01")));
        assert!(store.contains(date("2024-06-15")));
        assert!(store.contains(date("2024-06-20")));
        assert!(!store.contains(date("2024-06-10")));
    }

    #[test]
    fn replace_calendar_days_keeps_foreign_owner_and_merges_flags() {
        let mut store = BlockedDateStore::new();
        store.add_days(&[date("2024-06-05")], Some("Manual".into()), false);

        let mut incoming = synced("2024-06-05", "Airbnb");
        incoming.is_check_in = true;
        store.replace_calendar_days(3, vec![incoming]);

        let day = store.get(date("2024-06-05")).expect("day");
        assert!(day.is_manual());
        assert_eq!(day.reason.as_deref(), Some("Manual"));
        assert!(day.is_check_in);

        let change = store.remove_calendar_days(3);
        let day = store.get(date("2024-06-05")).expect("manual day survives");
        assert!(day.is_manual());
        assert!(!day.is_check_in);
        assert_eq!(change.added, vec![day.clone()]);
        assert_eq!(change.released, vec![(3, date("2024-06-05"))]);
    }

    #[test]
    fn shared_day_passes_to_remaining_calendar_when_owner_drops_it() {
        let mut store = BlockedDateStore::new();
        store.replace_calendar_days(2, vec![synced("2024-06-10", "Booking")]);
        store.replace_calendar_days(1, vec![synced("2024-06-10", "Airbnb")]);
        assert_eq!(store.status(date("2024-06-10")).source_calendar_id, Some(2));

        let change = store.replace_calendar_days(2, Vec::new());

        let status = store.status(date("2024-06-10"));
        assert!(status.blocked);
        assert_eq!(status.source_calendar_id, Some(1));
        assert_eq!(status.reason.as_deref(), Some("Airbnb"));
        assert!(change.removed.is_empty());
        assert_eq!(change.released, vec![(2, date("2024-06-10"))]);

        store.remove_calendar_days(1);
        assert!(!store.contains(date("2024-06-10")));
    }

    #[test]
    fn dropped_calendar_takes_its_markers_with_it() {
        let mut store = BlockedDateStore::new();
        let mut checkout = synced("2024-06-05", "Airbnb");
        checkout.is_check_out = true;
        let mut checkin = synced("2024-06-05", "Booking");
        checkin.is_check_in = true;
        store.replace_calendar_days(1, vec![checkout]);
        store.replace_calendar_days(2, vec![checkin]);
        let shared = store.status(date("2024-06-05"));
        assert!(shared.check_in && shared.check_out);

        store.replace_calendar_days(2, vec![synced("2024-06-20", "Booking")]);

        let status = store.status(date("2024-06-05"));
        assert_eq!(status.source_calendar_id, Some(1));
        assert!(!status.check_in);
        assert!(status.check_out);
    }

    #[test]
    fn restore_keeps_row_owner_and_remembers_other_claimants() {
        let mut owned = synced("2024-06-10", "Booking");
        owned.source_calendar_id = Some(2);
        let claims = vec![
            CalendarClaim::from_day(1, &synced("2024-06-10", "Airbnb")),
            CalendarClaim::from_day(2, &synced("2024-06-10", "Booking")),
        ];

        let mut store = BlockedDateStore::restore(vec![owned], claims);
        assert_eq!(store.status(date("2024-06-10")).source_calendar_id, Some(2));
        assert_eq!(store.days_from_calendar(1), vec![date("2024-06-10")]);

        store.remove_calendar_days(2);
        assert_eq!(store.status(date("2024-06-10")).source_calendar_id, Some(1));
    }

    #[test]
    fn removing_a_synced_day_drops_every_claim_on_it() {
        let mut store = BlockedDateStore::new();
        store.replace_calendar_days(1, vec![synced("2024-06-10", "Airbnb")]);
        store.replace_calendar_days(2, vec![synced("2024-06-10", "Booking")]);

        let change = store.remove_dates(&[date("2024-06-10")]);

        assert_eq!(change.removed, vec![date("2024-06-10")]);
        assert_eq!(change.released, vec![(1, date("2024-06-10")), (2, date("2024-06-10"))]);
        assert!(!store.status(date("2024-06-10")).blocked);
        assert!(store.days_from_calendar(1).is_empty());
    }

    #[test]
    fn replace_calendar_days_ors_flags_within_one_calendar() {
        let mut store = BlockedDateStore::new();
        let mut checkout = synced("2024-06-05", "Airbnb");
        checkout.is_check_out = true;
        let mut checkin = synced("2024-06-05", "Airbnb");
        checkin.is_check_in = true;

        let change = store.replace_calendar_days(1, vec![checkout, checkin]);

        let status = store.status(date("2024-06-05"));
        assert!(status.check_in && status.check_out);
        assert_eq!(status.source_calendar_id, Some(1));
        assert_eq!(change.added.len(), 1);
    }

    #[test]
    fn from_days_merges_duplicate_rows() {
        let mut first = synced("2024-06-05", "first");
        first.is_check_out = true;
        let mut second = synced("2024-06-05", "second");
        second.is_check_in = true;

        let store = BlockedDateStore::from_days(vec![first, second]);

        let day = store.get(date("2024-06-05")).expect("day");
        assert_eq!(day.reason.as_deref(), Some("second"));
        assert!(day.is_check_in && day.is_check_out);
    }

    proptest! {
        #[test]
        fn removed_dates_are_never_blocked(offsets in proptest::collection::vec(0i64..60, 1..30)) {
            let base = date("2024-01-01");
            let dates: Vec<NaiveDate> = offsets
                .iter()
                .map(|offset| base + chrono::Duration::days(*offset))
                .collect();
            let mut store = BlockedDateStore::new();
            store.add_period(range("2024-01-01", "2024-02-29"), Some("x".into()), false);

            store.remove_dates(&dates);

            for removed in &dates {
                prop_assert!(!store.status(*removed).blocked);
            }
        }
    }
}
