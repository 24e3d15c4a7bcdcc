use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::EscrowError;
use crate::ledger::{
    compute_digest, AccountId, Amount, DropId, DropState, DropView, EscrowEvent, FtAssetSpec,
    NearAmount, RegistrySnapshot, UseNumber, PER_KEY_STORAGE_COST,
};
use crate::transfer::{FtIssuer, TransferOutcome};

/// Coordinating service that owns every drop ledger and the funder balance
/// accounts.
///
/// Locking discipline: the drop map's `RwLock` is taken first, then the
/// target drop's `Mutex`, and both are held for the full read-compute-commit
/// span of a mutation. That gives single-writer-per-drop semantics while
/// operations on different drops run in parallel under the shared read lock.
/// `delete_keys` takes the map write lock so its gate check and the purge
/// are one atomic step relative to in-flight confirmations.
pub struct DropRegistry {
    issuer: Arc<dyn FtIssuer>,
    drops: RwLock<BTreeMap<DropId, Arc<Mutex<DropState>>>>,
    balances: Mutex<BTreeMap<AccountId, NearAmount>>,
    events: Mutex<Vec<EscrowEvent>>,
}

impl DropRegistry {
    pub fn new(issuer: Arc<dyn FtIssuer>) -> Self {
        Self {
            issuer,
            drops: RwLock::new(BTreeMap::new()),
            balances: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new drop with zero-balance escrow rows for every FT
    /// contract referenced in `assets_per_use`. The attached deposit must
    /// cover per-key storage for every key plus one registration cost per
    /// distinct asset; any excess is credited to the funder balance.
    pub fn create_drop(
        &self,
        funder_id: &str,
        drop_id: &str,
        assets_per_use: BTreeMap<UseNumber, Vec<FtAssetSpec>>,
        public_keys: Vec<String>,
        attached_deposit: NearAmount,
    ) -> Result<(), EscrowError> {
        let state = DropState::new(
            drop_id.to_string(),
            funder_id.to_string(),
            assets_per_use,
            public_keys,
        )?;
        let required = state.required_deposit();
        let key_supply = state.key_supply();

        let mut drops = self.drops.write().unwrap();
        if drops.contains_key(drop_id) {
            return Err(EscrowError::DuplicateDrop {
                drop_id: drop_id.to_string(),
            });
        }
        if attached_deposit < required {
            return Err(EscrowError::InsufficientDeposit {
                required,
                attached: attached_deposit,
            });
        }
        drops.insert(drop_id.to_string(), Arc::new(Mutex::new(state)));
        drop(drops);

        let excess = attached_deposit - required;
        if excess > 0 {
            self.credit_funder(funder_id, excess);
        }
        self.push_event(EscrowEvent::DropCreated {
            drop_id: drop_id.to_string(),
            funder_id: funder_id.to_string(),
            key_supply,
        });
        Ok(())
    }

    /// `None` means the drop does not exist, including "existed and was torn
    /// down" after a successful `delete_keys`.
    pub fn get_drop_information(&self, drop_id: &str) -> Option<DropView> {
        let drops = self.drops.read().unwrap();
        let cell = drops.get(drop_id)?;
        let state = cell.lock().unwrap();
        Some(DropView::from_state(&state))
    }

    pub fn get_key_supply_for_drop(&self, drop_id: &str) -> Result<u64, EscrowError> {
        let drops = self.drops.read().unwrap();
        let cell = drops.get(drop_id).ok_or_else(|| EscrowError::DropNotFound {
            drop_id: drop_id.to_string(),
        })?;
        let state = cell.lock().unwrap();
        Ok(state.key_supply())
    }

    /// Extends an existing drop's key set. Same deposit rule as creation:
    /// per-key storage for every added key, excess credited back.
    pub fn add_keys(
        &self,
        drop_id: &str,
        caller: &str,
        public_keys: Vec<String>,
        attached_deposit: NearAmount,
    ) -> Result<(), EscrowError> {
        let drops = self.drops.read().unwrap();
        let cell = drops.get(drop_id).ok_or_else(|| EscrowError::DropNotFound {
            drop_id: drop_id.to_string(),
        })?;
        let mut state = cell.lock().unwrap();
        if state.funder_id != caller {
            return Err(EscrowError::Unauthorized {
                caller: caller.to_string(),
            });
        }
        let required = public_keys.len() as NearAmount * PER_KEY_STORAGE_COST;
        if attached_deposit < required {
            return Err(EscrowError::InsufficientDeposit {
                required,
                attached: attached_deposit,
            });
        }
        state.add_keys(public_keys)?;
        let funder_id = state.funder_id.clone();
        drop(state);
        drop(drops);

        let excess = attached_deposit - required;
        if excess > 0 {
            self.credit_funder(&funder_id, excess);
        }
        Ok(())
    }

    /// Confirmation entry point for an inbound FT transfer: credits the
    /// matching row once the FT contract has acknowledged the deposit.
    /// Deposits for contracts never declared at creation are rejected and no
    /// row is materialized for them.
    pub fn on_asset_deposit(
        &self,
        drop_id: &str,
        contract_id: &str,
        amount: Amount,
    ) -> Result<(), EscrowError> {
        let drops = self.drops.read().unwrap();
        let cell = drops.get(drop_id).ok_or_else(|| EscrowError::DropNotFound {
            drop_id: drop_id.to_string(),
        })?;
        let mut state = cell.lock().unwrap();
        let row = state.row_mut(contract_id)?;
        row.credit(amount);
        let new_balance = row.balance_avail;
        drop(state);
        drop(drops);

        self.push_event(EscrowEvent::DepositConfirmed {
            drop_id: drop_id.to_string(),
            contract_id: contract_id.to_string(),
            amount,
            new_balance,
        });
        Ok(())
    }

    /// Moves escrowed tokens back to the funder of record. Omitting
    /// `tokens_to_withdraw` drains the row's entire current balance. The
    /// debit is tentative while the issuer transfer is in flight and is
    /// restored if the transfer fails, so callers only ever observe
    /// confirmed balances. Returns the amount actually withdrawn.
    pub fn withdraw_ft_balance(
        &self,
        drop_id: &str,
        caller: &str,
        contract_id: &str,
        tokens_to_withdraw: Option<Amount>,
    ) -> Result<Amount, EscrowError> {
        let drops = self.drops.read().unwrap();
        let cell = drops.get(drop_id).ok_or_else(|| EscrowError::DropNotFound {
            drop_id: drop_id.to_string(),
        })?;
        let mut state = cell.lock().unwrap();
        if state.funder_id != caller {
            return Err(EscrowError::Unauthorized {
                caller: caller.to_string(),
            });
        }
        let funder_id = state.funder_id.clone();
        let row = state.row_mut(contract_id)?;
        let amount = tokens_to_withdraw.unwrap_or(row.balance_avail);
        row.debit(amount)?;

        // The drop stays locked across settlement so no other mutation can
        // observe the tentative debit.
        let outcome = self.issuer.transfer(contract_id, &funder_id, amount);
        if outcome == TransferOutcome::Failed {
            state.row_mut(contract_id)?.credit(amount);
            drop(state);
            drop(drops);
            self.push_event(EscrowEvent::WithdrawalFailed {
                drop_id: drop_id.to_string(),
                contract_id: contract_id.to_string(),
                amount,
            });
            return Err(EscrowError::TransferFailed {
                contract_id: contract_id.to_string(),
                amount,
            });
        }
        let new_balance = state.row(contract_id)?.balance_avail;
        drop(state);
        drop(drops);

        self.push_event(EscrowEvent::WithdrawalConfirmed {
            drop_id: drop_id.to_string(),
            contract_id: contract_id.to_string(),
            amount,
            new_balance,
        });
        Ok(amount)
    }

    /// Deletes all keys for a drop and purges it, crediting the per-key
    /// storage refund to the funder. Fails with `AssetsNotWithdrawn`, and
    /// changes nothing, while any row still holds escrowed balance: the drop
    /// must never disappear while it custodies third-party funds. Returns
    /// the refund credited.
    pub fn delete_keys(&self, drop_id: &str, caller: &str) -> Result<NearAmount, EscrowError> {
        let mut drops = self.drops.write().unwrap();
        let cell = drops
            .get(drop_id)
            .cloned()
            .ok_or_else(|| EscrowError::DropNotFound {
                drop_id: drop_id.to_string(),
            })?;
        let state = cell.lock().unwrap();
        if state.funder_id != caller {
            return Err(EscrowError::Unauthorized {
                caller: caller.to_string(),
            });
        }
        if !state.all_withdrawn() {
            return Err(EscrowError::AssetsNotWithdrawn {
                drop_id: drop_id.to_string(),
            });
        }
        let keys_removed = state.key_supply();
        let funder_id = state.funder_id.clone();
        drop(state);
        drops.remove(drop_id);
        drop(drops);

        let refund = keys_removed as NearAmount * PER_KEY_STORAGE_COST;
        self.credit_funder(&funder_id, refund);
        self.push_event(EscrowEvent::KeysDeleted {
            drop_id: drop_id.to_string(),
            keys_removed,
        });
        self.push_event(EscrowEvent::RefundCredited {
            funder_id,
            amount: refund,
        });
        Ok(refund)
    }

    /// In-system NEAR balance for an account. Zero for accounts never
    /// credited.
    pub fn get_user_balance(&self, account_id: &str) -> NearAmount {
        self.balances
            .lock()
            .unwrap()
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let drops = self.drops.read().unwrap();
        let views: Vec<DropView> = drops
            .values()
            .map(|cell| DropView::from_state(&cell.lock().unwrap()))
            .collect();
        drop(drops);
        let balances = self.balances.lock().unwrap().clone();
        let events = self.events.lock().unwrap().clone();
        let digest = compute_digest(&views, &balances);
        RegistrySnapshot {
            drops: views,
            balances,
            events,
            digest_hex: hex::encode(digest),
        }
    }

    pub fn events(&self) -> Vec<EscrowEvent> {
        self.events.lock().unwrap().clone()
    }

    fn credit_funder(&self, account_id: &str, amount: NearAmount) {
        let mut balances = self.balances.lock().unwrap();
        *balances.entry(account_id.to_string()).or_insert(0) += amount;
    }

    fn push_event(&self, event: EscrowEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ONE_NEAR;
    use crate::transfer::RecordingIssuer;

    fn ft_asset(contract_id: &str) -> FtAssetSpec {
        FtAssetSpec {
            contract_id: contract_id.to_string(),
            registration_cost: PER_KEY_STORAGE_COST,
            amount: ONE_NEAR,
        }
    }

    fn single_use(contract_id: &str) -> BTreeMap<UseNumber, Vec<FtAssetSpec>> {
        let mut uses = BTreeMap::new();
        uses.insert(1, vec![ft_asset(contract_id)]);
        uses
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ed25519:key{i}")).collect()
    }

    fn registry() -> (DropRegistry, Arc<RecordingIssuer>) {
        let issuer = Arc::new(RecordingIssuer::new());
        (DropRegistry::new(issuer.clone()), issuer)
    }

    #[test]
    fn single_use_single_ft_underpay_withdraw_delete() {
        let (registry, _issuer) = registry();
        registry
            .create_drop(
                "funder",
                "underpay-delete-all",
                single_use("ft_contract_1"),
                keys(50),
                10 * ONE_NEAR,
            )
            .unwrap();

        let info = registry.get_drop_information("underpay-delete-all").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 0);
        assert_eq!(
            registry.get_key_supply_for_drop("underpay-delete-all").unwrap(),
            50
        );

        registry
            .on_asset_deposit("underpay-delete-all", "ft_contract_1", 5)
            .unwrap();
        let info = registry.get_drop_information("underpay-delete-all").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 5);

        // Deletion gate: escrowed balance blocks teardown and nothing moves.
        let err = registry
            .delete_keys("underpay-delete-all", "funder")
            .unwrap_err();
        assert!(matches!(err, EscrowError::AssetsNotWithdrawn { .. }));
        let info = registry.get_drop_information("underpay-delete-all").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 5);
        assert_eq!(
            registry.get_key_supply_for_drop("underpay-delete-all").unwrap(),
            50
        );

        registry
            .withdraw_ft_balance("underpay-delete-all", "funder", "ft_contract_1", Some(5))
            .unwrap();
        let info = registry.get_drop_information("underpay-delete-all").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 0);

        registry.delete_keys("underpay-delete-all", "funder").unwrap();
        let err = registry
            .get_key_supply_for_drop("underpay-delete-all")
            .unwrap_err();
        assert!(matches!(err, EscrowError::DropNotFound { .. }));

        // 50 keys * 0.0125 NEAR come back to the funder.
        assert!(registry.get_user_balance("funder") >= 50 * PER_KEY_STORAGE_COST);
        assert!(registry.get_drop_information("underpay-delete-all").is_none());
    }

    #[test]
    fn duplicate_drop_rejected() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        let err = registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateDrop { .. }));
    }

    #[test]
    fn creation_deposit_must_cover_keys_and_registration() {
        let (registry, _) = registry();
        let required = 2 * PER_KEY_STORAGE_COST + PER_KEY_STORAGE_COST;
        let err = registry
            .create_drop("funder", "d1", single_use("ft1"), keys(2), required - 1)
            .unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientDeposit { .. }));
        assert!(registry.get_drop_information("d1").is_none());

        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(2), required)
            .unwrap();
        assert_eq!(registry.get_user_balance("funder"), 0);
    }

    #[test]
    fn overpayment_is_credited_to_funder_balance() {
        let (registry, _) = registry();
        let required = PER_KEY_STORAGE_COST + PER_KEY_STORAGE_COST;
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), required + 7)
            .unwrap();
        assert_eq!(registry.get_user_balance("funder"), 7);
    }

    #[test]
    fn deposits_sum_regardless_of_order() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        for amount in [3u128, 11, 1, 20] {
            registry.on_asset_deposit("d1", "ft1", amount).unwrap();
        }
        let info = registry.get_drop_information("d1").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 35);
    }

    #[test]
    fn concurrent_deposits_serialize_per_drop() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    registry.on_asset_deposit("d1", "ft1", 1).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let info = registry.get_drop_information("d1").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 800);
    }

    #[test]
    fn deposit_for_undeclared_asset_rejected_without_new_row() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        let err = registry.on_asset_deposit("d1", "ft2", 5).unwrap_err();
        assert!(matches!(err, EscrowError::UnknownAssetForDrop { .. }));
        let info = registry.get_drop_information("d1").unwrap();
        assert_eq!(info.internal_assets_data.len(), 1);
        assert_eq!(info.internal_assets_data[0].contract_id, "ft1");
    }

    #[test]
    fn deposit_into_deleted_drop_is_drop_not_found() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        registry.delete_keys("d1", "funder").unwrap();
        let err = registry.on_asset_deposit("d1", "ft1", 5).unwrap_err();
        assert!(matches!(err, EscrowError::DropNotFound { .. }));
    }

    #[test]
    fn withdrawal_requires_funder_and_sufficient_balance() {
        let (registry, issuer) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        registry.on_asset_deposit("d1", "ft1", 5).unwrap();

        let err = registry
            .withdraw_ft_balance("d1", "mallory", "ft1", Some(5))
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { .. }));

        let err = registry
            .withdraw_ft_balance("d1", "funder", "ft1", Some(6))
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::InsufficientBalance { found: 5, needed: 6 }
        ));
        let info = registry.get_drop_information("d1").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 5);
        assert!(issuer.confirmed_transfers().is_empty());
    }

    #[test]
    fn withdraw_all_drains_the_row() {
        let (registry, issuer) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        registry.on_asset_deposit("d1", "ft1", 42).unwrap();
        let withdrawn = registry
            .withdraw_ft_balance("d1", "funder", "ft1", None)
            .unwrap();
        assert_eq!(withdrawn, 42);
        let info = registry.get_drop_information("d1").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 0);
        let records = issuer.confirmed_transfers();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].receiver, "funder");
        assert_eq!(records[0].amount, 42);
    }

    #[test]
    fn failed_transfer_rolls_the_debit_back() {
        let (registry, issuer) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        registry.on_asset_deposit("d1", "ft1", 9).unwrap();

        issuer.fail_contract("ft1");
        let err = registry
            .withdraw_ft_balance("d1", "funder", "ft1", Some(9))
            .unwrap_err();
        assert!(matches!(err, EscrowError::TransferFailed { .. }));
        let info = registry.get_drop_information("d1").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 9);

        // The drop is still gated: nothing actually left escrow.
        let err = registry.delete_keys("d1", "funder").unwrap_err();
        assert!(matches!(err, EscrowError::AssetsNotWithdrawn { .. }));

        issuer.restore_contract("ft1");
        registry
            .withdraw_ft_balance("d1", "funder", "ft1", None)
            .unwrap();
        registry.delete_keys("d1", "funder").unwrap();
    }

    #[test]
    fn delete_requires_funder() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(3), ONE_NEAR)
            .unwrap();
        let err = registry.delete_keys("d1", "mallory").unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { .. }));
        assert_eq!(registry.get_key_supply_for_drop("d1").unwrap(), 3);
    }

    #[test]
    fn refund_credited_exactly_once() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(4), ONE_NEAR)
            .unwrap();
        let excess = registry.get_user_balance("funder");
        let refund = registry.delete_keys("d1", "funder").unwrap();
        assert_eq!(refund, 4 * PER_KEY_STORAGE_COST);
        assert_eq!(registry.get_user_balance("funder"), excess + refund);

        // Second deletion finds nothing and credits nothing.
        let err = registry.delete_keys("d1", "funder").unwrap_err();
        assert!(matches!(err, EscrowError::DropNotFound { .. }));
        assert_eq!(registry.get_user_balance("funder"), excess + refund);
    }

    #[test]
    fn multi_asset_gate_needs_every_row_drained() {
        let (registry, _) = registry();
        let mut uses = BTreeMap::new();
        uses.insert(1, vec![ft_asset("ft1"), ft_asset("ft2")]);
        registry
            .create_drop("funder", "d1", uses, keys(2), ONE_NEAR)
            .unwrap();
        registry.on_asset_deposit("d1", "ft1", 3).unwrap();
        registry.on_asset_deposit("d1", "ft2", 4).unwrap();

        registry
            .withdraw_ft_balance("d1", "funder", "ft1", None)
            .unwrap();
        let err = registry.delete_keys("d1", "funder").unwrap_err();
        assert!(matches!(err, EscrowError::AssetsNotWithdrawn { .. }));

        registry
            .withdraw_ft_balance("d1", "funder", "ft2", None)
            .unwrap();
        registry.delete_keys("d1", "funder").unwrap();
        assert!(registry.get_drop_information("d1").is_none());
    }

    #[test]
    fn drops_are_independent_ledgers() {
        let (registry, issuer) = registry();
        registry
            .create_drop("alice", "a", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        registry
            .create_drop("bob", "b", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        registry.on_asset_deposit("a", "ft1", 10).unwrap();
        registry.on_asset_deposit("b", "ft1", 20).unwrap();

        issuer.fail_contract("ft1");
        let err = registry
            .withdraw_ft_balance("a", "alice", "ft1", None)
            .unwrap_err();
        assert!(matches!(err, EscrowError::TransferFailed { .. }));

        // Bob's ledger is untouched by Alice's failed withdrawal.
        let info = registry.get_drop_information("b").unwrap();
        assert_eq!(info.internal_assets_data[0].balance_avail, 20);
    }

    #[test]
    fn add_keys_grows_supply_and_refund() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(2), ONE_NEAR)
            .unwrap();
        let err = registry
            .add_keys("d1", "mallory", vec!["pk-x".into()], PER_KEY_STORAGE_COST)
            .unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { .. }));

        let err = registry
            .add_keys("d1", "funder", vec!["pk-x".into()], PER_KEY_STORAGE_COST - 1)
            .unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientDeposit { .. }));

        registry
            .add_keys("d1", "funder", vec!["pk-x".into()], PER_KEY_STORAGE_COST)
            .unwrap();
        assert_eq!(registry.get_key_supply_for_drop("d1").unwrap(), 3);

        let before = registry.get_user_balance("funder");
        let refund = registry.delete_keys("d1", "funder").unwrap();
        assert_eq!(refund, 3 * PER_KEY_STORAGE_COST);
        assert_eq!(registry.get_user_balance("funder"), before + refund);
    }

    #[test]
    fn snapshot_commits_to_balances() {
        let (registry, _) = registry();
        registry
            .create_drop("funder", "d1", single_use("ft1"), keys(1), ONE_NEAR)
            .unwrap();
        let before = registry.snapshot();
        registry.on_asset_deposit("d1", "ft1", 1).unwrap();
        let after = registry.snapshot();
        assert_ne!(before.digest_hex, after.digest_hex);
        assert_eq!(after.drops.len(), 1);
        assert!(after
            .events
            .iter()
            .any(|e| matches!(e, EscrowEvent::DepositConfirmed { amount: 1, .. })));
    }
}
