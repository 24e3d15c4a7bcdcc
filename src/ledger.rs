use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EscrowError;

pub type AccountId = String;
pub type DropId = String;
pub type ContractId = String;
pub type UseNumber = u32;
/// Fungible-token units. FT amounts regularly exceed u64 range.
pub type Amount = u128;
/// yoctoNEAR.
pub type NearAmount = u128;

pub const ONE_NEAR: NearAmount = 1_000_000_000_000_000_000_000_000;

/// Storage allotment charged per access key at drop creation and returned
/// to the funder when the keys are deleted. 0.0125 NEAR.
pub const PER_KEY_STORAGE_COST: NearAmount = ONE_NEAR / 80;

/// Per-use fungible-token requirement as the funder declares it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FtAssetSpec {
    pub contract_id: ContractId,
    /// One-time cost of registering the escrow account with the FT contract.
    pub registration_cost: NearAmount,
    /// Tokens consumed per key use.
    pub amount: Amount,
}

/// Escrow balance for one FT contract within one drop.
///
/// `balance_avail` only ever moves on confirmed external transfers: credited
/// by a confirmed deposit, debited by a confirmed withdrawal. It starts at
/// zero because assets arrive separately from drop creation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRow {
    pub contract_id: ContractId,
    pub registration_cost: NearAmount,
    pub balance_avail: Amount,
}

impl AssetRow {
    pub fn new(contract_id: ContractId, registration_cost: NearAmount) -> Self {
        Self {
            contract_id,
            registration_cost,
            balance_avail: 0,
        }
    }

    pub fn credit(&mut self, amount: Amount) {
        self.balance_avail += amount;
    }

    pub fn debit(&mut self, amount: Amount) -> Result<(), EscrowError> {
        if self.balance_avail < amount {
            return Err(EscrowError::InsufficientBalance {
                found: self.balance_avail,
                needed: amount,
            });
        }
        self.balance_avail -= amount;
        Ok(())
    }
}

/// Full internal record for one drop. Owned by the registry, one per
/// `drop_id`; rows are keyed by FT contract and unique within the drop.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropState {
    pub drop_id: DropId,
    pub funder_id: AccountId,
    pub assets_per_use: BTreeMap<UseNumber, Vec<FtAssetSpec>>,
    pub public_keys: BTreeSet<String>,
    pub rows: BTreeMap<ContractId, AssetRow>,
}

impl DropState {
    /// Validates the per-use map and materializes one zero-balance row per
    /// distinct FT contract referenced anywhere in it. Use numbers must run
    /// 1..=n contiguously and each use must declare at least one asset.
    pub fn new(
        drop_id: DropId,
        funder_id: AccountId,
        assets_per_use: BTreeMap<UseNumber, Vec<FtAssetSpec>>,
        public_keys: Vec<String>,
    ) -> Result<Self, EscrowError> {
        let uses_per_key = assets_per_use.len() as UseNumber;
        let mut rows: BTreeMap<ContractId, AssetRow> = BTreeMap::new();
        for (use_number, assets) in &assets_per_use {
            if *use_number == 0 || *use_number > uses_per_key {
                return Err(EscrowError::InvalidUseNumber {
                    use_number: *use_number,
                    uses_per_key,
                });
            }
            if assets.is_empty() {
                return Err(EscrowError::EmptyUse {
                    use_number: *use_number,
                });
            }
            for asset in assets {
                // First declaration of a contract wins; later uses of the
                // same contract share its row.
                rows.entry(asset.contract_id.clone()).or_insert_with(|| {
                    AssetRow::new(asset.contract_id.clone(), asset.registration_cost)
                });
            }
        }
        let mut keys = BTreeSet::new();
        for key in public_keys {
            if !keys.insert(key.clone()) {
                return Err(EscrowError::DuplicateKey {
                    drop_id: drop_id.clone(),
                    key,
                });
            }
        }
        Ok(Self {
            drop_id,
            funder_id,
            assets_per_use,
            public_keys: keys,
            rows,
        })
    }

    pub fn key_supply(&self) -> u64 {
        self.public_keys.len() as u64
    }

    /// Deposit the funder must attach at creation: per-key storage for every
    /// key plus one registration cost per distinct asset contract.
    pub fn required_deposit(&self) -> NearAmount {
        self.key_supply() as NearAmount * PER_KEY_STORAGE_COST
            + self.rows.values().map(|r| r.registration_cost).sum::<NearAmount>()
    }

    pub fn row(&self, contract_id: &str) -> Result<&AssetRow, EscrowError> {
        self.rows
            .get(contract_id)
            .ok_or_else(|| EscrowError::UnknownAssetForDrop {
                drop_id: self.drop_id.clone(),
                contract_id: contract_id.to_string(),
            })
    }

    pub fn row_mut(&mut self, contract_id: &str) -> Result<&mut AssetRow, EscrowError> {
        let drop_id = self.drop_id.clone();
        self.rows
            .get_mut(contract_id)
            .ok_or_else(|| EscrowError::UnknownAssetForDrop {
                drop_id,
                contract_id: contract_id.to_string(),
            })
    }

    /// The deletion gate reads this as one consistent snapshot: the drop may
    /// only be torn down once every row has been drained.
    pub fn all_withdrawn(&self) -> bool {
        self.rows.values().all(|row| row.balance_avail == 0)
    }

    pub fn add_keys(&mut self, public_keys: Vec<String>) -> Result<(), EscrowError> {
        for key in &public_keys {
            if self.public_keys.contains(key) {
                return Err(EscrowError::DuplicateKey {
                    drop_id: self.drop_id.clone(),
                    key: key.clone(),
                });
            }
        }
        self.public_keys.extend(public_keys);
        Ok(())
    }
}

/// Caller-facing projection of a drop, what `get_drop_information` returns.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DropView {
    pub drop_id: DropId,
    pub funder_id: AccountId,
    pub key_supply: u64,
    pub assets_per_use: BTreeMap<UseNumber, Vec<FtAssetSpec>>,
    pub internal_assets_data: Vec<AssetRow>,
}

impl DropView {
    pub fn from_state(state: &DropState) -> Self {
        Self {
            drop_id: state.drop_id.clone(),
            funder_id: state.funder_id.clone(),
            key_supply: state.key_supply(),
            assets_per_use: state.assets_per_use.clone(),
            internal_assets_data: state.rows.values().cloned().collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscrowEvent {
    DropCreated {
        drop_id: DropId,
        funder_id: AccountId,
        key_supply: u64,
    },
    DepositConfirmed {
        drop_id: DropId,
        contract_id: ContractId,
        amount: Amount,
        new_balance: Amount,
    },
    WithdrawalConfirmed {
        drop_id: DropId,
        contract_id: ContractId,
        amount: Amount,
        new_balance: Amount,
    },
    WithdrawalFailed {
        drop_id: DropId,
        contract_id: ContractId,
        amount: Amount,
    },
    KeysDeleted {
        drop_id: DropId,
        keys_removed: u64,
    },
    RefundCredited {
        funder_id: AccountId,
        amount: NearAmount,
    },
}

/// Point-in-time projection of the whole registry with a digest over the
/// balances it commits to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub drops: Vec<DropView>,
    pub balances: BTreeMap<AccountId, NearAmount>,
    pub events: Vec<EscrowEvent>,
    pub digest_hex: String,
}

pub(crate) fn compute_digest(
    drops: &[DropView],
    balances: &BTreeMap<AccountId, NearAmount>,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    for drop in drops {
        let mut hasher = Sha256::new();
        hasher.update(b"drop");
        hasher.update(drop.drop_id.as_bytes());
        hasher.update(drop.funder_id.as_bytes());
        hasher.update(drop.key_supply.to_le_bytes());
        for row in &drop.internal_assets_data {
            hasher.update(row.contract_id.as_bytes());
            hasher.update(row.registration_cost.to_le_bytes());
            hasher.update(row.balance_avail.to_le_bytes());
        }
        leaves.push(hasher.finalize().into());
    }
    for (account, amount) in balances {
        let mut hasher = Sha256::new();
        hasher.update(b"funder");
        hasher.update(account.as_bytes());
        hasher.update(amount.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"drop-escrow-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
