//! In-memory spend ledgers. Daily spend rolls to zero at the UTC date
//! change; lifetime spend only resets with the process. Check-and-increment
//! runs under one write lock so the sequence is linearizable per mandate id.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::utils::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Daily,
    Lifetime,
}

/// A charge applied before the downstream stages ran; reverted if any of
/// them denies or the upstream fails without capture.
#[derive(Debug, Clone)]
pub struct TentativeCharge {
    pub kind: LedgerKind,
    pub key: String,
    pub micros: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WouldExceed {
    pub spent_micros: u64,
}

#[derive(Debug, Clone, Copy)]
struct DailyEntry {
    date: NaiveDate,
    spent_micros: u64,
}

pub struct SpendLedgers {
    daily: RwLock<HashMap<String, DailyEntry>>,
    lifetime: RwLock<HashMap<String, u64>>,
    clock: Arc<dyn Clock>,
}

impl SpendLedgers {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            daily: RwLock::new(HashMap::new()),
            lifetime: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Spend recorded for the mandate today (UTC).
    pub fn daily_spent(&self, mandate_id: &str) -> u64 {
        let today = self.today();
        self.daily
            .read()
            .unwrap()
            .get(mandate_id)
            .filter(|entry| entry.date == today)
            .map(|entry| entry.spent_micros)
            .unwrap_or(0)
    }

    /// Atomically check `spent + amount <= cap` and record the charge.
    pub fn try_charge_daily(
        &self,
        mandate_id: &str,
        amount_micros: u64,
        cap_micros: u64,
    ) -> Result<(), WouldExceed> {
        let today = self.today();
        let mut daily = self.daily.write().unwrap();
        let entry = daily
            .entry(mandate_id.to_string())
            .or_insert(DailyEntry {
                date: today,
                spent_micros: 0,
            });
        if entry.date != today {
            entry.date = today;
            entry.spent_micros = 0;
        }
        let proposed = entry.spent_micros.saturating_add(amount_micros);
        if proposed > cap_micros {
            return Err(WouldExceed {
                spent_micros: entry.spent_micros,
            });
        }
        entry.spent_micros = proposed;
        Ok(())
    }

    pub fn revert_daily(&self, mandate_id: &str, amount_micros: u64) {
        let today = self.today();
        let mut daily = self.daily.write().unwrap();
        if let Some(entry) = daily.get_mut(mandate_id) {
            if entry.date == today {
                entry.spent_micros = entry.spent_micros.saturating_sub(amount_micros);
            }
        }
    }

    pub fn lifetime_spent(&self, intent_mandate_id: &str) -> u64 {
        self.lifetime
            .read()
            .unwrap()
            .get(intent_mandate_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn try_charge_lifetime(
        &self,
        intent_mandate_id: &str,
        amount_micros: u64,
        cap_micros: u64,
    ) -> Result<(), WouldExceed> {
        let mut lifetime = self.lifetime.write().unwrap();
        let spent = lifetime.entry(intent_mandate_id.to_string()).or_insert(0);
        let proposed = spent.saturating_add(amount_micros);
        if proposed > cap_micros {
            return Err(WouldExceed {
                spent_micros: *spent,
            });
        }
        *spent = proposed;
        Ok(())
    }

    pub fn revert_lifetime(&self, intent_mandate_id: &str, amount_micros: u64) {
        let mut lifetime = self.lifetime.write().unwrap();
        if let Some(spent) = lifetime.get_mut(intent_mandate_id) {
            *spent = spent.saturating_sub(amount_micros);
        }
    }

    pub fn revert(&self, charge: &TentativeCharge) {
        match charge.kind {
            LedgerKind::Daily => self.revert_daily(&charge.key, charge.micros),
            LedgerKind::Lifetime => self.revert_lifetime(&charge.key, charge.micros),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::FixedClock;
    use chrono::{TimeZone, Utc};

    fn ledgers() -> (Arc<FixedClock>, SpendLedgers) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap(),
        ));
        (clock.clone(), SpendLedgers::new(clock))
    }

    #[test]
    fn daily_cap_enforced_and_revert_restores() {
        let (_, ledgers) = ledgers();
        assert!(ledgers.try_charge_daily("m1", 30_000, 50_000).is_ok());
        let err = ledgers.try_charge_daily("m1", 30_000, 50_000).unwrap_err();
        assert_eq!(err.spent_micros, 30_000);

        ledgers.revert_daily("m1", 30_000);
        assert_eq!(ledgers.daily_spent("m1"), 0);
        assert!(ledgers.try_charge_daily("m1", 50_000, 50_000).is_ok());
    }

    #[test]
    fn daily_ledger_rolls_over_at_utc_midnight() {
        let (clock, ledgers) = ledgers();
        ledgers.try_charge_daily("m1", 40_000, 50_000).unwrap();
        assert_eq!(ledgers.daily_spent("m1"), 40_000);

        clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 1).unwrap());
        assert_eq!(ledgers.daily_spent("m1"), 0);
        assert!(ledgers.try_charge_daily("m1", 50_000, 50_000).is_ok());
    }

    #[test]
    fn lifetime_ledger_never_resets() {
        let (clock, ledgers) = ledgers();
        ledgers
            .try_charge_lifetime("intent-abc", 900_000, 1_000_000)
            .unwrap();
        clock.set(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(ledgers.lifetime_spent("intent-abc"), 900_000);
        assert!(ledgers
            .try_charge_lifetime("intent-abc", 200_000, 1_000_000)
            .is_err());
    }

    #[test]
    fn ledgers_are_disjoint() {
        let (_, ledgers) = ledgers();
        ledgers.try_charge_daily("id", 10, 100).unwrap();
        assert_eq!(ledgers.lifetime_spent("id"), 0);
    }

    #[test]
    fn tentative_charge_reverts_to_right_ledger() {
        let (_, ledgers) = ledgers();
        ledgers.try_charge_lifetime("intent-x", 500, 1_000).unwrap();
        ledgers.revert(&TentativeCharge {
            kind: LedgerKind::Lifetime,
            key: "intent-x".to_string(),
            micros: 500,
        });
        assert_eq!(ledgers.lifetime_spent("intent-x"), 0);
    }
}
