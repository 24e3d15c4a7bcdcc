use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::ledger::{AccountId, Amount, ContractId};

/// Settlement result reported by the token-transfer collaborator. The
/// registry only mutates balances once this outcome is known, never
/// optimistically before it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Confirmed,
    Failed,
}

/// Seam to the external fungible-token contracts. An implementation asks the
/// FT contract at `contract_id` to move `amount` tokens out of escrow to
/// `receiver` and reports how the transfer settled.
pub trait FtIssuer: Send + Sync {
    fn transfer(&self, contract_id: &str, receiver: &str, amount: Amount) -> TransferOutcome;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub contract_id: ContractId,
    pub receiver: AccountId,
    pub amount: Amount,
}

/// In-process issuer: confirms every transfer and keeps a record of what
/// settled. Individual FT contracts can be scripted to fail, which is how
/// the rollback path gets exercised.
#[derive(Default)]
pub struct RecordingIssuer {
    confirmed: Mutex<Vec<TransferRecord>>,
    failing: Mutex<BTreeSet<ContractId>>,
}

impl RecordingIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent transfer via `contract_id` reports `Failed`.
    pub fn fail_contract(&self, contract_id: &str) {
        self.failing.lock().unwrap().insert(contract_id.to_string());
    }

    pub fn restore_contract(&self, contract_id: &str) {
        self.failing.lock().unwrap().remove(contract_id);
    }

    pub fn confirmed_transfers(&self) -> Vec<TransferRecord> {
        self.confirmed.lock().unwrap().clone()
    }
}

impl FtIssuer for RecordingIssuer {
    fn transfer(&self, contract_id: &str, receiver: &str, amount: Amount) -> TransferOutcome {
        if self.failing.lock().unwrap().contains(contract_id) {
            return TransferOutcome::Failed;
        }
        self.confirmed.lock().unwrap().push(TransferRecord {
            contract_id: contract_id.to_string(),
            receiver: receiver.to_string(),
            amount,
        });
        TransferOutcome::Confirmed
    }
}
