use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use drop_escrow::keys::generate_public_keys;
use drop_escrow::ledger::{Amount, NearAmount, UseNumber};
use drop_escrow::{DropRegistry, FtAssetSpec, RecordingIssuer};

#[derive(Parser)]
#[command(name = "drop-escrow", about = "Run drop escrow scenarios against an in-process registry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a JSON scenario file and print the final registry snapshot.
    Run { scenario: PathBuf },
    /// Print fresh ed25519 public keys for seeding a drop.
    Keygen {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ScenarioOp {
    CreateDrop {
        funder_id: String,
        drop_id: String,
        assets_per_use: BTreeMap<UseNumber, Vec<FtAssetSpec>>,
        #[serde(default)]
        public_keys: Vec<String>,
        /// Generate this many keys in addition to any listed explicitly.
        #[serde(default)]
        generate_keys: usize,
        attached_deposit: NearAmount,
    },
    Deposit {
        drop_id: String,
        contract_id: String,
        amount: Amount,
    },
    Withdraw {
        drop_id: String,
        caller: String,
        contract_id: String,
        tokens_to_withdraw: Option<Amount>,
    },
    AddKeys {
        drop_id: String,
        caller: String,
        public_keys: Vec<String>,
        attached_deposit: NearAmount,
    },
    DeleteKeys {
        drop_id: String,
        caller: String,
    },
    /// Script the FT issuer to fail transfers for a contract.
    FailContract {
        contract_id: String,
    },
    RestoreContract {
        contract_id: String,
    },
}

fn run_scenario(path: &PathBuf) {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("error: cannot read {}: {err}", path.display());
            std::process::exit(2);
        }
    };
    let ops: Vec<ScenarioOp> = match serde_json::from_slice(&bytes) {
        Ok(ops) => ops,
        Err(err) => {
            eprintln!("error: scenario parse: {err}");
            std::process::exit(2);
        }
    };

    let issuer = Arc::new(RecordingIssuer::new());
    let registry = DropRegistry::new(issuer.clone());

    for (step, op) in ops.into_iter().enumerate() {
        let result = match op {
            ScenarioOp::CreateDrop {
                funder_id,
                drop_id,
                assets_per_use,
                mut public_keys,
                generate_keys,
                attached_deposit,
            } => {
                public_keys.extend(generate_public_keys(generate_keys));
                registry
                    .create_drop(
                        &funder_id,
                        &drop_id,
                        assets_per_use,
                        public_keys,
                        attached_deposit,
                    )
                    .map(|_| format!("created drop {drop_id}"))
            }
            ScenarioOp::Deposit {
                drop_id,
                contract_id,
                amount,
            } => registry
                .on_asset_deposit(&drop_id, &contract_id, amount)
                .map(|_| format!("deposited {amount} of {contract_id} into {drop_id}")),
            ScenarioOp::Withdraw {
                drop_id,
                caller,
                contract_id,
                tokens_to_withdraw,
            } => registry
                .withdraw_ft_balance(&drop_id, &caller, &contract_id, tokens_to_withdraw)
                .map(|amount| format!("withdrew {amount} of {contract_id} from {drop_id}")),
            ScenarioOp::AddKeys {
                drop_id,
                caller,
                public_keys,
                attached_deposit,
            } => registry
                .add_keys(&drop_id, &caller, public_keys, attached_deposit)
                .map(|_| format!("added keys to {drop_id}")),
            ScenarioOp::DeleteKeys { drop_id, caller } => registry
                .delete_keys(&drop_id, &caller)
                .map(|refund| format!("deleted keys of {drop_id}, refunded {refund}")),
            ScenarioOp::FailContract { contract_id } => {
                issuer.fail_contract(&contract_id);
                Ok(format!("issuer now failing {contract_id}"))
            }
            ScenarioOp::RestoreContract { contract_id } => {
                issuer.restore_contract(&contract_id);
                Ok(format!("issuer restored {contract_id}"))
            }
        };
        match result {
            Ok(summary) => println!("step {step}: {summary}"),
            Err(err) => {
                eprintln!("step {step} failed: {err}");
                std::process::exit(2);
            }
        }
    }

    let snapshot = registry.snapshot();
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("error: snapshot encode: {err}");
            std::process::exit(2);
        }
    }
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { scenario } => run_scenario(&scenario),
        Command::Keygen { count } => {
            for key in generate_public_keys(count) {
                println!("{key}");
            }
        }
    }
}
