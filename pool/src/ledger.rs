use chrono::Utc;

use crate::models::*;
use crate::money::Cents;
use crate::pricing::{HourlyRate, PriceTable};
use crate::status::PoolStatus;
use crate::storage::{LedgerSnapshot, LedgerStore, StorageError};

pub const DEFAULT_EXPERIENCE: &str = "beginner";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("steward {0} not found")]
    StewardNotFound(u32),
    #[error("not enough {platform} credit: {available} available, {requested} requested")]
    InsufficientCredit {
        platform: Platform,
        available: Cents,
        requested: Cents,
    },
    #[error("donation amount must be positive")]
    InvalidAmount,
    #[error("hours must be a positive number, got {0}")]
    InvalidHours(f64),
    #[error("the {0} pool cannot hold any more credit")]
    PoolOverflow(Platform),
    #[error("no steward ids left")]
    StewardIdsExhausted,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A recorded donation with its estimated compute impact.
#[derive(Debug, Clone, PartialEq)]
pub struct DonationReceipt {
    pub platform: Platform,
    pub donation: Donation,
    pub impact_hours: f64,
}

/// The donation pool ledger.
///
/// Owns the in-memory collections and writes them back through its store
/// after every mutation. Mutations are built on a copy of the state and
/// only replace it once the store accepted the save.
pub struct Ledger<S> {
    store: S,
    state: LedgerSnapshot,
    prices: PriceTable,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn open(store: S) -> Result<Self, LedgerError> {
        let state = store.load()?;
        Ok(Self {
            store,
            state,
            prices: PriceTable::default(),
        })
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub fn snapshot(&self) -> &LedgerSnapshot {
        &self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Discard in-memory state and load it again from the store.
    pub fn reload(&mut self) -> Result<(), LedgerError> {
        self.state = self.store.load()?;
        Ok(())
    }

    pub fn steward(&self, id: u32) -> Option<&Steward> {
        self.state.stewards.iter().find(|s| s.id == id)
    }

    /// Sum of all donations to a platform, or `None` if it exceeds `u64::MAX` cents.
    fn donated(&self, platform: Platform) -> Option<Cents> {
        self.state
            .donations
            .bucket(platform)
            .iter()
            .try_fold(Cents::ZERO, |total, d| total.checked_add(d.amount))
    }

    /// Unconsumed credit in a platform bucket.
    pub fn available(&self, platform: Platform) -> Cents {
        self.state
            .donations
            .bucket(platform)
            .iter()
            .map(Donation::remaining)
            .sum()
    }

    fn commit(&mut self, next: LedgerSnapshot) -> Result<(), LedgerError> {
        self.store.save(&next)?;
        self.state = next;
        Ok(())
    }

    pub fn donate(
        &mut self,
        platform: Platform,
        amount: Cents,
        donor: impl Into<String>,
        contact: Option<String>,
    ) -> Result<DonationReceipt, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }
        if self.donated(platform).and_then(|total| total.checked_add(amount)).is_none() {
            return Err(LedgerError::PoolOverflow(platform));
        }
        let donation = Donation {
            amount,
            donor: donor.into(),
            contact,
            timestamp: Utc::now(),
            used: Cents::ZERO,
        };

        let mut next = self.state.clone();
        next.donations.bucket_mut(platform).push(donation.clone());
        self.commit(next)?;

        tracing::debug!(%platform, %amount, donor = %donation.donor, "Recorded donation");
        Ok(DonationReceipt {
            platform,
            impact_hours: self.prices.impact_hours(platform, amount),
            donation,
        })
    }

    pub fn register_steward(
        &mut self,
        name: impl Into<String>,
        contact: impl Into<String>,
        experience: impl Into<String>,
    ) -> Result<Steward, LedgerError> {
        let id = self.state.next_steward_id;
        let following = id.checked_add(1).ok_or(LedgerError::StewardIdsExhausted)?;
        let mut next = self.state.clone();
        let steward = Steward {
            id,
            name: name.into(),
            contact: contact.into(),
            experience: experience.into(),
            joined: Utc::now(),
            allocations: Vec::new(),
            total_hours: 0.0,
        };
        next.next_steward_id = following;
        next.stewards.push(steward.clone());
        self.commit(next)?;

        tracing::debug!(steward_id = steward.id, name = %steward.name, "Registered steward");
        Ok(steward)
    }

    /// Allocate hours to a steward at the price table's rate for `platform`.
    pub fn allocate(
        &mut self,
        steward_id: u32,
        hours: f64,
        platform: Platform,
    ) -> Result<Allocation, LedgerError> {
        let rate = self.prices.rate(platform);
        self.allocate_at_rate(steward_id, hours, platform, rate)
    }

    /// Allocate hours to a steward at an explicit hourly rate.
    ///
    /// Credit is taken from the platform's donations in the order they were
    /// made, each one drained before moving to the next.
    pub fn allocate_at_rate(
        &mut self,
        steward_id: u32,
        hours: f64,
        platform: Platform,
        rate: HourlyRate,
    ) -> Result<Allocation, LedgerError> {
        if !hours.is_finite() || hours <= 0.0 {
            return Err(LedgerError::InvalidHours(hours));
        }
        let steward_idx = self
            .state
            .stewards
            .iter()
            .position(|s| s.id == steward_id)
            .ok_or(LedgerError::StewardNotFound(steward_id))?;
        let cost = rate.cost(hours).ok_or(LedgerError::InvalidHours(hours))?;

        let available = self.available(platform);
        if available < cost {
            return Err(LedgerError::InsufficientCredit {
                platform,
                available,
                requested: cost,
            });
        }

        let mut next = self.state.clone();
        let mut outstanding = cost;
        for donation in next.donations.bucket_mut(platform).iter_mut() {
            if outstanding.is_zero() {
                break;
            }
            let take = donation.remaining().min(outstanding);
            donation.used = donation.used + take;
            outstanding = outstanding.saturating_sub(take);
        }
        debug_assert!(outstanding.is_zero(), "credit check passed but {outstanding} left");

        let steward = &mut next.stewards[steward_idx];
        let allocation = Allocation {
            id: next.allocations.last().map_or(1, |a| a.id + 1),
            steward_id,
            steward_name: steward.name.clone(),
            hours,
            platform,
            cost,
            rate,
            timestamp: Utc::now(),
            status: AllocationStatus::Active,
        };
        steward.allocations.push(allocation.clone());
        steward.total_hours += hours;
        next.allocations.push(allocation.clone());
        self.commit(next)?;

        tracing::debug!(
            steward_id,
            hours,
            %platform,
            %cost,
            "Allocated hours"
        );
        Ok(allocation)
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus::new(&self.state, &self.prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{JsonDirStore, MemoryStore};

    fn ledger() -> Ledger<MemoryStore> {
        Ledger::open(MemoryStore::new()).unwrap()
    }

    fn used(ledger: &Ledger<MemoryStore>, platform: Platform) -> Vec<Cents> {
        ledger
            .snapshot()
            .donations
            .bucket(platform)
            .iter()
            .map(|d| d.used)
            .collect()
    }

    #[test]
    fn test_donate_then_allocate_example() {
        let mut ledger = ledger();
        ledger.donate(Platform::Vast, Cents::from_dollars(50), "Grace", None).unwrap();
        ledger.register_steward("Ada", "ada@example.org", DEFAULT_EXPERIENCE).unwrap();
        assert_eq!(ledger.available(Platform::Vast), Cents::from_dollars(50));

        let allocation = ledger.allocate(1, 100.0, Platform::Vast).unwrap();
        assert_eq!(allocation.cost, Cents::from_dollars(20));
        assert_eq!(allocation.status, AllocationStatus::Active);
        assert_eq!(ledger.available(Platform::Vast), Cents::from_dollars(30));
        assert_eq!(ledger.steward(1).unwrap().total_hours, 100.0);

        let before = ledger.snapshot().clone();
        let err = ledger.allocate(1, 200.0, Platform::Vast).unwrap_err();
        match err {
            LedgerError::InsufficientCredit { available, requested, .. } => {
                assert_eq!(available, Cents::from_dollars(30));
                assert_eq!(requested, Cents::from_dollars(40));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.snapshot(), &before);
    }

    #[test]
    fn test_unknown_steward_creates_nothing() {
        let mut ledger = ledger();
        ledger.donate(Platform::Vast, Cents::from_dollars(10), "Grace", None).unwrap();
        let saves = ledger.store().saves();

        let err = ledger.allocate(42, 1.0, Platform::Vast).unwrap_err();
        assert!(matches!(err, LedgerError::StewardNotFound(42)));
        assert!(ledger.snapshot().allocations.is_empty());
        assert_eq!(used(&ledger, Platform::Vast), vec![Cents::ZERO]);
        assert_eq!(ledger.store().saves(), saves);
    }

    #[test]
    fn test_first_fit_in_donation_order() {
        let mut ledger = ledger();
        ledger.donate(Platform::Aws, Cents(300), "a", None).unwrap();
        ledger.donate(Platform::Aws, Cents(1000), "b", None).unwrap();
        ledger.donate(Platform::Aws, Cents(200), "c", None).unwrap();
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();

        // 10h at $0.50 = $5.00: drains the first donation, then part of the second
        ledger.allocate(1, 10.0, Platform::Aws).unwrap();
        assert_eq!(used(&ledger, Platform::Aws), vec![Cents(300), Cents(200), Cents::ZERO]);

        ledger.allocate(1, 18.0, Platform::Aws).unwrap();
        assert_eq!(used(&ledger, Platform::Aws), vec![Cents(300), Cents(1000), Cents(100)]);
        assert_eq!(ledger.available(Platform::Aws), Cents(100));
    }

    #[test]
    fn test_used_deltas_equal_cost() {
        let mut ledger = ledger();
        for amount in [137, 29, 4000, 1] {
            ledger.donate(Platform::Vast, Cents(amount), "donor", None).unwrap();
        }
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();

        for hours in [0.5, 3.3, 12.0, 7.25] {
            let before: Cents = used(&ledger, Platform::Vast).into_iter().sum();
            let allocation = ledger.allocate(1, hours, Platform::Vast).unwrap();
            let after: Cents = used(&ledger, Platform::Vast).into_iter().sum();
            assert_eq!(after.checked_sub(before), Some(allocation.cost));
        }
    }

    #[test]
    fn test_allocation_recorded_on_steward_and_globally() {
        let mut ledger = ledger();
        ledger.donate(Platform::Gcp, Cents::from_dollars(10), "Grace", None).unwrap();
        ledger.register_steward("Ada", "ada", "expert").unwrap();
        ledger.register_steward("Lin", "lin", DEFAULT_EXPERIENCE).unwrap();

        let first = ledger.allocate(2, 4.0, Platform::Gcp).unwrap();
        let second = ledger.allocate(2, 2.0, Platform::Gcp).unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(first.steward_name, "Lin");

        let steward = ledger.steward(2).unwrap();
        assert_eq!(steward.allocations, vec![first.clone(), second.clone()]);
        assert_eq!(steward.total_hours, 6.0);
        assert_eq!(ledger.snapshot().allocations, vec![first, second]);
        assert_eq!(ledger.steward(1).unwrap().total_hours, 0.0);
    }

    #[test]
    fn test_explicit_rate() {
        let mut ledger = ledger();
        ledger.donate(Platform::Vast, Cents::from_dollars(5), "Grace", None).unwrap();
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();

        let rate = HourlyRate::new(0.087).unwrap();
        let allocation = ledger.allocate_at_rate(1, 10.0, Platform::Vast, rate).unwrap();
        assert_eq!(allocation.cost, Cents(87));
        assert_eq!(allocation.rate, rate);
        assert_eq!(ledger.available(Platform::Vast), Cents(413));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let mut ledger = ledger();
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();
        assert!(matches!(
            ledger.donate(Platform::Vast, Cents::ZERO, "nobody", None),
            Err(LedgerError::InvalidAmount)
        ));
        for hours in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ledger.allocate(1, hours, Platform::Vast),
                Err(LedgerError::InvalidHours(_))
            ));
        }
    }

    #[test]
    fn test_empty_bucket_is_insufficient() {
        let mut ledger = ledger();
        ledger.donate(Platform::Vast, Cents::from_dollars(100), "Grace", None).unwrap();
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();
        let err = ledger.allocate(1, 1.0, Platform::Azure).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientCredit { platform: Platform::Azure, available: Cents::ZERO, .. }
        ));
    }

    #[test]
    fn test_failed_save_changes_nothing() {
        let mut ledger = ledger();
        ledger.donate(Platform::Vast, Cents::from_dollars(50), "Grace", None).unwrap();
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();
        let before = ledger.snapshot().clone();

        ledger.store_mut().set_fail_saves(true);
        assert!(matches!(
            ledger.allocate(1, 10.0, Platform::Vast),
            Err(LedgerError::Storage(_))
        ));
        assert!(ledger.register_steward("Lin", "lin", DEFAULT_EXPERIENCE).is_err());
        assert!(ledger.donate(Platform::Aws, Cents(100), "x", None).is_err());
        assert_eq!(ledger.snapshot(), &before);

        ledger.store_mut().set_fail_saves(false);
        assert_eq!(ledger.register_steward("Lin", "lin", DEFAULT_EXPERIENCE).unwrap().id, 2);
    }

    #[test]
    fn test_steward_ids_not_reused_after_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::open(JsonDirStore::new(tmp.path())).unwrap();
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();
        ledger.register_steward("Lin", "lin", DEFAULT_EXPERIENCE).unwrap();

        // Drop the last steward behind the ledger's back.
        let mut snapshot = ledger.snapshot().clone();
        snapshot.stewards.pop();
        let mut store = JsonDirStore::new(tmp.path());
        store.save(&snapshot).unwrap();

        let mut reopened = Ledger::open(JsonDirStore::new(tmp.path())).unwrap();
        assert_eq!(reopened.register_steward("Kai", "kai", DEFAULT_EXPERIENCE).unwrap().id, 3);
    }

    #[test]
    fn test_state_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut ledger = Ledger::open(JsonDirStore::new(tmp.path())).unwrap();
            ledger.donate(Platform::Vast, Cents::from_dollars(50), "Grace", Some("g@x".into())).unwrap();
            ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();
            ledger.allocate(1, 100.0, Platform::Vast).unwrap();
        }
        let ledger = Ledger::open(JsonDirStore::new(tmp.path())).unwrap();
        assert_eq!(ledger.available(Platform::Vast), Cents::from_dollars(30));
        assert_eq!(ledger.snapshot().allocations.len(), 1);
        assert_eq!(ledger.steward(1).unwrap().allocations.len(), 1);
    }

    #[test]
    fn test_receipt_reports_impact() {
        let mut ledger = ledger();
        let receipt = ledger.donate(Platform::Vast, Cents::from_dollars(50), "Grace", None).unwrap();
        assert_eq!(receipt.impact_hours.round(), 250.0);
        assert_eq!(receipt.donation.used, Cents::ZERO);
        assert_eq!(ledger.store().saves(), 1);
    }

    #[test]
    fn test_pool_total_cannot_overflow() {
        let mut ledger = ledger();
        ledger.donate(Platform::Vast, Cents(u64::MAX), "whale", None).unwrap();
        let before = ledger.snapshot().clone();

        assert!(matches!(
            ledger.donate(Platform::Vast, Cents(1), "minnow", None),
            Err(LedgerError::PoolOverflow(Platform::Vast))
        ));
        assert_eq!(ledger.snapshot(), &before);

        // other buckets are independent, the cross-platform total saturates
        ledger.donate(Platform::Aws, Cents(5), "minnow", None).unwrap();
        let status = ledger.status();
        assert_eq!(status.platform(Platform::Vast).unwrap().available, Cents(u64::MAX));
        assert_eq!(status.total_donated, Cents(u64::MAX));
    }

    #[test]
    fn test_steward_ids_exhausted() {
        let snapshot = LedgerSnapshot {
            next_steward_id: u32::MAX - 1,
            ..LedgerSnapshot::default()
        };
        let mut ledger = Ledger::open(MemoryStore::with_snapshot(snapshot)).unwrap();
        assert_eq!(ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap().id, u32::MAX - 1);

        let before = ledger.snapshot().clone();
        assert!(matches!(
            ledger.register_steward("Lin", "lin", DEFAULT_EXPERIENCE),
            Err(LedgerError::StewardIdsExhausted)
        ));
        assert_eq!(ledger.snapshot(), &before);
    }

    #[test]
    fn test_custom_price_table() {
        let prices = PriceTable { vast: Cents(10), other: Cents(100) };
        let mut ledger = ledger().with_prices(prices);
        assert_eq!(ledger.prices(), &prices);

        let receipt = ledger.donate(Platform::Gcp, Cents::from_dollars(10), "Grace", None).unwrap();
        assert_eq!(receipt.impact_hours, 10.0);
        ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();
        assert_eq!(ledger.allocate(1, 3.0, Platform::Gcp).unwrap().cost, Cents::from_dollars(3));
    }

    #[test]
    fn test_reload_sees_other_writers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reader = Ledger::open(JsonDirStore::new(tmp.path())).unwrap();
        let mut writer = Ledger::open(JsonDirStore::new(tmp.path())).unwrap();
        writer.donate(Platform::Azure, Cents(750), "Grace", None).unwrap();

        assert_eq!(reader.available(Platform::Azure), Cents::ZERO);
        reader.reload().unwrap();
        assert_eq!(reader.available(Platform::Azure), Cents(750));
        assert_eq!(reader.snapshot(), writer.snapshot());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Donate(Platform, u64),
            Allocate(Platform, f64),
        }

        fn platform() -> impl Strategy<Value = Platform> {
            prop::sample::select(Platform::ALL.to_vec())
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (platform(), 1..50_000u64).prop_map(|(p, cents)| Op::Donate(p, cents)),
                (platform(), 0.01..400.0f64).prop_map(|(p, hours)| Op::Allocate(p, hours)),
            ]
        }

        fn ops() -> impl Strategy<Value = Vec<Op>> {
            prop::collection::vec(op(), 1..40)
        }

        fn funded_ledger() -> Ledger<MemoryStore> {
            let mut ledger = ledger();
            ledger.register_steward("Ada", "ada", DEFAULT_EXPERIENCE).unwrap();
            ledger
        }

        fn apply(ledger: &mut Ledger<MemoryStore>, op: &Op) -> Result<(), LedgerError> {
            match *op {
                Op::Donate(platform, cents) => ledger.donate(platform, Cents(cents), "donor", None).map(|_| ()),
                Op::Allocate(platform, hours) => ledger.allocate(1, hours, platform).map(|_| ()),
            }
        }

        fn total_used(ledger: &Ledger<MemoryStore>, platform: Platform) -> Cents {
            used(ledger, platform).into_iter().sum()
        }

        proptest! {
            #[test]
            fn test_available_is_donated_minus_used(ops in ops()) {
                let mut ledger = funded_ledger();
                for op in &ops {
                    let _ = apply(&mut ledger, op);
                    for platform in Platform::ALL {
                        let bucket = ledger.snapshot().donations.bucket(platform);
                        let donated: u64 = bucket.iter().map(|d| d.amount.0).sum();
                        let used: u64 = bucket.iter().map(|d| d.used.0).sum();
                        prop_assert!(used <= donated);
                        prop_assert_eq!(ledger.available(platform), Cents(donated - used));
                        prop_assert_eq!(ledger.status().platform(platform).unwrap().available, Cents(donated - used));
                    }
                }
            }

            #[test]
            fn test_allocation_debits_exactly_its_cost(ops in ops()) {
                let mut ledger = funded_ledger();
                for op in &ops {
                    let Op::Allocate(platform, hours) = *op else {
                        apply(&mut ledger, op).unwrap();
                        continue;
                    };
                    let before = total_used(&ledger, platform);
                    let steward_hours = ledger.steward(1).unwrap().total_hours;
                    if let Ok(allocation) = ledger.allocate(1, hours, platform) {
                        let after = total_used(&ledger, platform);
                        prop_assert_eq!(after.checked_sub(before), Some(allocation.cost));
                        prop_assert_eq!(ledger.steward(1).unwrap().total_hours, steward_hours + hours);
                    }
                }
            }

            #[test]
            fn test_rejected_allocation_changes_nothing(ops in ops()) {
                let mut ledger = funded_ledger();
                for op in &ops {
                    let before = ledger.snapshot().clone();
                    let saves = ledger.store().saves();
                    if let Err(err) = apply(&mut ledger, op) {
                        let is_shortfall = matches!(
                            err,
                            LedgerError::InsufficientCredit { available, requested, .. } if available < requested
                        );
                        prop_assert!(is_shortfall);
                        prop_assert_eq!(ledger.snapshot(), &before);
                        prop_assert_eq!(ledger.store().saves(), saves);
                    }
                }
            }

            #[test]
            fn test_status_is_idempotent(ops in ops()) {
                let mut ledger = funded_ledger();
                for op in &ops {
                    let _ = apply(&mut ledger, op);
                }
                let first = ledger.status();
                let second = ledger.status();
                prop_assert_eq!(first.to_string(), second.to_string());
                prop_assert_eq!(first, second);
            }
        }
    }
}
