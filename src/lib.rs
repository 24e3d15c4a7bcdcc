//! Escrow ledger for fungible-token drops.
//!
//! A funder creates a drop: a batch of distributable access keys with
//! per-use FT requirements. Token deposits are credited only once the FT
//! contract confirms them, withdrawals debit only on confirmed settlement,
//! and a drop can never be deleted while any of its escrow rows still holds
//! balance. Deleting the keys returns the per-key storage allotment to the
//! funder's in-system balance.

pub mod error;
pub mod keys;
pub mod ledger;
pub mod registry;
pub mod transfer;

pub use error::EscrowError;
pub use ledger::{
    AssetRow, DropState, DropView, EscrowEvent, FtAssetSpec, RegistrySnapshot, ONE_NEAR,
    PER_KEY_STORAGE_COST,
};
pub use registry::DropRegistry;
pub use transfer::{FtIssuer, RecordingIssuer, TransferOutcome, TransferRecord};
