//! Token ledger
//!
//! Economic incentives for the consensus network. The whole supply
//! starts in the treasury; commit and vote rewards flow out of it,
//! optional burns take tokens out of circulation. At every mutation
//! `treasury + sum(balances) + burned == total_supply` holds, checked
//! in debug builds.
//!
//! The ledger also owns the per-AS reward multipliers. Mutation is
//! serialized behind one mutex; every operation is point-in-time
//! consistent.

use {
  crate::{config::LedgerConfig, primitives::Asn},
  serde::Serialize,
  std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
  },
  thiserror::Error,
  tracing::debug,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
  #[error("insufficient funds: needed {needed}, available {available}")]
  InsufficientFunds { needed: u64, available: u64 },
}

/// Behavioral scaling applied to award amounts. Each factor starts
/// at 1.0 and drifts within [0.25, 2.0] as the node participates,
/// votes accurately and detects real attacks.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RewardMultipliers {
  pub accuracy: f64,
  pub participation: f64,
  pub quality: f64,
}

const MULTIPLIER_FLOOR: f64 = 0.25;
const MULTIPLIER_CEIL: f64 = 2.0;

impl Default for RewardMultipliers {
  fn default() -> Self {
    Self {
      accuracy: 1.0,
      participation: 1.0,
      quality: 1.0,
    }
  }
}

impl RewardMultipliers {
  fn product(&self) -> f64 {
    self.accuracy * self.participation * self.quality
  }
}

fn clamp(value: f64) -> f64 {
  value.clamp(MULTIPLIER_FLOOR, MULTIPLIER_CEIL)
}

#[derive(Debug, Default)]
struct LedgerState {
  treasury: u64,
  balances: BTreeMap<Asn, u64>,
  total_distributed: u64,
  total_burned: u64,
  multipliers: BTreeMap<Asn, RewardMultipliers>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerReport {
  pub total_supply: u64,
  pub treasury: u64,
  pub total_distributed: u64,
  pub total_burned: u64,
  pub balances: BTreeMap<Asn, u64>,
  pub multipliers: BTreeMap<Asn, RewardMultipliers>,
}

pub struct TokenLedger {
  total_supply: u64,
  state: Mutex<LedgerState>,
}

impl TokenLedger {
  pub fn new(cfg: &LedgerConfig) -> Arc<Self> {
    Arc::new(Self {
      total_supply: cfg.total_supply,
      state: Mutex::new(LedgerState {
        treasury: cfg.total_supply,
        ..LedgerState::default()
      }),
    })
  }

  fn check(&self, state: &LedgerState) {
    debug_assert_eq!(
      state.treasury
        + state.balances.values().sum::<u64>()
        + state.total_burned,
      self.total_supply,
      "ledger conservation violated"
    );
  }

  /// Pays `base` tokens from the treasury to `asn`, scaled by the
  /// recipient's multipliers. Fails without side effects when the
  /// treasury cannot cover the scaled amount.
  pub fn award(&self, asn: Asn, base: u64) -> Result<u64, LedgerError> {
    if base == 0 {
      return Ok(0);
    }
    let mut state = self.state.lock().unwrap();
    let product = state.multipliers.get(&asn).copied().unwrap_or_default().product();
    let amount = ((base as f64 * product).floor() as u64).max(1);
    if amount > state.treasury {
      return Err(LedgerError::InsufficientFunds {
        needed: amount,
        available: state.treasury,
      });
    }
    state.treasury -= amount;
    *state.balances.entry(asn).or_insert(0) += amount;
    state.total_distributed += amount;
    self.check(&state);
    debug!("awarded {amount} to {asn}");
    Ok(amount)
  }

  /// Unscaled transfer from the treasury.
  pub fn credit(&self, asn: Asn, amount: u64) -> Result<(), LedgerError> {
    let mut state = self.state.lock().unwrap();
    if amount > state.treasury {
      return Err(LedgerError::InsufficientFunds {
        needed: amount,
        available: state.treasury,
      });
    }
    state.treasury -= amount;
    *state.balances.entry(asn).or_insert(0) += amount;
    state.total_distributed += amount;
    self.check(&state);
    Ok(())
  }

  /// Returns tokens from a balance to the treasury.
  pub fn debit(&self, asn: Asn, amount: u64) -> Result<(), LedgerError> {
    let mut guard = self.state.lock().unwrap();
    let state = &mut *guard;
    let balance = state.balances.entry(asn).or_insert(0);
    if amount > *balance {
      let available = *balance;
      return Err(LedgerError::InsufficientFunds {
        needed: amount,
        available,
      });
    }
    *balance -= amount;
    state.treasury += amount;
    state.total_distributed = state.total_distributed.saturating_sub(amount);
    self.check(state);
    Ok(())
  }

  /// Removes tokens from circulation entirely.
  pub fn burn(&self, asn: Asn, amount: u64) -> Result<(), LedgerError> {
    let mut guard = self.state.lock().unwrap();
    let state = &mut *guard;
    let balance = state.balances.entry(asn).or_insert(0);
    if amount > *balance {
      let available = *balance;
      return Err(LedgerError::InsufficientFunds {
        needed: amount,
        available,
      });
    }
    *balance -= amount;
    state.total_burned += amount;
    self.check(state);
    Ok(())
  }

  pub fn balance_of(&self, asn: Asn) -> u64 {
    self
      .state
      .lock()
      .unwrap()
      .balances
      .get(&asn)
      .copied()
      .unwrap_or(0)
  }

  pub fn treasury(&self) -> u64 {
    self.state.lock().unwrap().treasury
  }

  pub fn bump_participation(&self, asn: Asn) {
    self.adjust(asn, |m| m.participation = clamp(m.participation + 0.01));
  }

  pub fn bump_accuracy(&self, asn: Asn, accurate: bool) {
    self.adjust(asn, |m| {
      let delta = if accurate { 0.02 } else { -0.05 };
      m.accuracy = clamp(m.accuracy + delta);
    });
  }

  pub fn bump_quality(&self, asn: Asn) {
    self.adjust(asn, |m| m.quality = clamp(m.quality + 0.02));
  }

  fn adjust(&self, asn: Asn, f: impl FnOnce(&mut RewardMultipliers)) {
    let mut state = self.state.lock().unwrap();
    f(state.multipliers.entry(asn).or_default());
  }

  pub fn report(&self) -> LedgerReport {
    let state = self.state.lock().unwrap();
    LedgerReport {
      total_supply: self.total_supply,
      treasury: state.treasury,
      total_distributed: state.total_distributed,
      total_burned: state.total_burned,
      balances: state.balances.clone(),
      multipliers: state.multipliers.clone(),
    }
  }

  /// The conservation sum, exposed for end-of-run assertions.
  pub fn conservation_holds(&self) -> bool {
    let state = self.state.lock().unwrap();
    state.treasury
      + state.balances.values().sum::<u64>()
      + state.total_burned
      == self.total_supply
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{LedgerError, TokenLedger},
    crate::{config::LedgerConfig, primitives::Asn},
  };

  fn ledger(supply: u64) -> std::sync::Arc<TokenLedger> {
    TokenLedger::new(&LedgerConfig {
      total_supply: supply,
      ..LedgerConfig::default()
    })
  }

  #[test]
  fn award_moves_tokens_out_of_treasury() {
    let ledger = ledger(1000);
    let paid = ledger.award(Asn(1), 10).unwrap();
    assert_eq!(paid, 10);
    assert_eq!(ledger.balance_of(Asn(1)), 10);
    assert_eq!(ledger.treasury(), 990);
    assert!(ledger.conservation_holds());
  }

  #[test]
  fn award_scales_with_multipliers() {
    let ledger = ledger(1000);
    for _ in 0..100 {
      ledger.bump_quality(Asn(1)); // clamped at the 2.0 ceiling
    }
    let paid = ledger.award(Asn(1), 10).unwrap();
    assert_eq!(paid, 20);
  }

  #[test]
  fn empty_treasury_fails_cleanly() {
    let ledger = ledger(5);
    assert_eq!(ledger.award(Asn(1), 5).unwrap(), 5);
    let err = ledger.award(Asn(2), 5).unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    assert_eq!(ledger.balance_of(Asn(2)), 0);
    assert!(ledger.conservation_holds());
  }

  #[test]
  fn credit_then_debit_restores_balances() {
    let ledger = ledger(1000);
    ledger.credit(Asn(1), 100).unwrap();
    ledger.debit(Asn(1), 100).unwrap();
    assert_eq!(ledger.balance_of(Asn(1)), 0);
    assert_eq!(ledger.treasury(), 1000);
    assert!(ledger.conservation_holds());
  }

  #[test]
  fn debit_underflow_is_rejected() {
    let ledger = ledger(1000);
    ledger.credit(Asn(1), 10).unwrap();
    assert_eq!(
      ledger.debit(Asn(1), 11),
      Err(LedgerError::InsufficientFunds {
        needed: 11,
        available: 10
      })
    );
  }

  #[test]
  fn burn_preserves_conservation() {
    let ledger = ledger(1000);
    ledger.credit(Asn(1), 100).unwrap();
    ledger.burn(Asn(1), 40).unwrap();
    assert_eq!(ledger.balance_of(Asn(1)), 60);
    assert_eq!(ledger.treasury(), 900);
    assert!(ledger.conservation_holds());
    assert_eq!(ledger.report().total_burned, 40);
  }

  #[test]
  fn multipliers_stay_clamped() {
    let ledger = ledger(1000);
    for _ in 0..200 {
      ledger.bump_accuracy(Asn(1), false);
    }
    let report = ledger.report();
    assert!(report.multipliers[&Asn(1)].accuracy >= 0.25);
    // awards still pay at least one token
    assert!(ledger.award(Asn(1), 1).unwrap() >= 1);
  }
}
