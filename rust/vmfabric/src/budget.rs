//! Per-device physical memory accounting.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Physical memory capacity of one device.
#[derive(Clone)]
pub struct Budget(Arc<BudgetNode>);

struct BudgetNode {
    total: u64,
    remaining: AtomicU64,
}

impl Budget {
    pub fn new(total: u64) -> Budget {
        Budget(Arc::new(BudgetNode {
            total,
            remaining: AtomicU64::new(total),
        }))
    }

    pub fn total(&self) -> u64 {
        self.0.total
    }

    /// Returns the amount not currently charged.
    ///
    /// **Note**: intended for diagnostics; the value may already be outdated when
    /// other threads allocate concurrently.
    pub fn remaining(&self) -> u64 {
        self.0.remaining.load(Ordering::Acquire)
    }

    /// Charges `amount` against the budget. The amount is credited back when the
    /// returned [`Charge`] is dropped.
    pub fn charge(&self, amount: u64) -> Result<Charge, AllocationError> {
        if self.0.withdraw(amount) {
            Ok(Charge {
                budget: self.0.clone(),
                amount,
            })
        } else {
            Err(AllocationError {
                requested: amount,
                remaining: self.remaining(),
            })
        }
    }
}

impl std::fmt::Debug for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Budget")
            .field("total", &self.total())
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl BudgetNode {
    fn withdraw(&self, amount: u64) -> bool {
        let mut current = self.remaining.load(Ordering::Relaxed);
        while current >= amount {
            match self.remaining.compare_exchange_weak(
                current,
                current - amount,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(updated) => current = updated,
            }
        }
        false
    }

    fn deposit(&self, amount: u64) {
        self.remaining.fetch_add(amount, Ordering::AcqRel);
    }
}

/// An amount charged against a [`Budget`], returned on drop.
pub struct Charge {
    budget: Arc<BudgetNode>,
    amount: u64,
}

impl Charge {
    pub fn amount(&self) -> u64 {
        self.amount
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        if self.amount != 0 {
            self.budget.deposit(self.amount);
        }
    }
}

impl std::fmt::Debug for Charge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Charge")
            .field("amount", &self.amount)
            .finish_non_exhaustive()
    }
}

/// The budget lacks the funds for a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationError {
    pub requested: u64,
    pub remaining: u64,
}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "out of device memory: requested {} bytes, {} remaining",
            self.requested, self.remaining
        )
    }
}

impl std::error::Error for AllocationError {}
