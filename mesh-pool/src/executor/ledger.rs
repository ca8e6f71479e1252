//! Transfer accounting for the scatter and gather phases

use crate::errors::{PoolError, Result};
use serde::Serialize;

/// One worker's share of a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub worker_index: usize,
    pub element_count: usize,
    /// Payload bytes moved, counting both inputs on scatter
    pub byte_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scatter,
    Gather,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scatter => "scatter",
            Phase::Gather => "gather",
        }
    }
}

/// Records what each worker was sent and returned
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferLedger {
    /// Elements in one full matrix
    expected: usize,
    scatter: Vec<TransferRecord>,
    gather: Vec<TransferRecord>,
}

impl TransferLedger {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            scatter: Vec::new(),
            gather: Vec::new(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn record(&mut self, phase: Phase, worker_index: usize, element_count: usize) {
        let payloads = match phase {
            Phase::Scatter => 2,
            Phase::Gather => 1,
        };
        let record = TransferRecord {
            worker_index,
            element_count,
            byte_count: element_count * payloads * std::mem::size_of::<f64>(),
        };
        match phase {
            Phase::Scatter => self.scatter.push(record),
            Phase::Gather => self.gather.push(record),
        }
    }

    pub fn records(&self, phase: Phase) -> &[TransferRecord] {
        match phase {
            Phase::Scatter => &self.scatter,
            Phase::Gather => &self.gather,
        }
    }

    /// Elements accounted for in `phase`
    pub fn total(&self, phase: Phase) -> usize {
        self.records(phase).iter().map(|r| r.element_count).sum()
    }

    pub fn total_bytes(&self, phase: Phase) -> usize {
        self.records(phase).iter().map(|r| r.byte_count).sum()
    }

    /// Fail unless `phase` moved exactly one full matrix
    pub fn verify(&self, phase: Phase) -> Result<()> {
        let actual = self.total(phase);
        if actual != self.expected {
            return Err(PoolError::Consistency {
                phase: phase.as_str(),
                expected: self.expected,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_totals() {
        let mut ledger = TransferLedger::new(8);
        ledger.record(Phase::Scatter, 0, 4);
        ledger.record(Phase::Scatter, 1, 2);
        ledger.record(Phase::Scatter, 2, 2);
        assert_eq!(ledger.total(Phase::Scatter), 8);
        assert_eq!(ledger.total_bytes(Phase::Scatter), 8 * 2 * 8);
        assert!(ledger.verify(Phase::Scatter).is_ok());

        // Nothing gathered yet
        let err = ledger.verify(Phase::Gather).unwrap_err();
        assert!(matches!(
            err,
            PoolError::Consistency {
                phase: "gather",
                expected: 8,
                actual: 0
            }
        ));
    }

    #[test]
    fn test_ledger_detects_overcount() {
        let mut ledger = TransferLedger::new(4);
        ledger.record(Phase::Gather, 0, 4);
        ledger.record(Phase::Gather, 1, 1);
        assert!(ledger.verify(Phase::Gather).is_err());
        assert_eq!(ledger.records(Phase::Gather).len(), 2);
    }

    #[test]
    fn test_empty_matrix_verifies() {
        let ledger = TransferLedger::new(0);
        assert!(ledger.verify(Phase::Scatter).is_ok());
        assert!(ledger.verify(Phase::Gather).is_ok());
    }
}
