use crate::ledger::{Amount, ContractId, DropId, NearAmount, UseNumber};

/// Everything that can go wrong inside the escrow core.
///
/// Every variant is recoverable: a failed call leaves the ledger exactly as
/// it was (for `TransferFailed`, restored to its pre-call state). A failure
/// on one drop never affects another drop.
#[derive(Debug, thiserror::Error)]
pub enum EscrowError {
    #[error("drop {drop_id} already exists")]
    DuplicateDrop { drop_id: DropId },
    #[error("no drop found for {drop_id}")]
    DropNotFound { drop_id: DropId },
    #[error("invalid use number {use_number}, uses must run 1..={uses_per_key} with no gaps")]
    InvalidUseNumber {
        use_number: UseNumber,
        uses_per_key: UseNumber,
    },
    #[error("use {use_number} declares no assets")]
    EmptyUse { use_number: UseNumber },
    #[error("attached deposit {attached} below required {required}")]
    InsufficientDeposit {
        required: NearAmount,
        attached: NearAmount,
    },
    #[error("asset {contract_id} is not registered for drop {drop_id}")]
    UnknownAssetForDrop {
        drop_id: DropId,
        contract_id: ContractId,
    },
    #[error("drop {drop_id} still holds escrowed assets, withdraw them first")]
    AssetsNotWithdrawn { drop_id: DropId },
    #[error("not enough balance to transfer. Found {found} but needed {needed}")]
    InsufficientBalance { found: Amount, needed: Amount },
    #[error("only the drop funder may call this, caller was {caller}")]
    Unauthorized { caller: String },
    #[error("public key {key} already registered for drop {drop_id}")]
    DuplicateKey { drop_id: DropId, key: String },
    #[error("token transfer of {amount} via {contract_id} failed, balance restored")]
    TransferFailed {
        contract_id: ContractId,
        amount: Amount,
    },
}
