use std::path::PathBuf;
use std::process::ExitCode;

use binmark_lib::commands::{self, MarketDraft};
use binmark_lib::{AppError, AppStateManager, Network};
use binmark_sdk::{ContractId, KeySigner, MarketOrchestrator, cancel_pair};
use binmark_store::MarketSort;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "binmark", version, about = "Binary YES/NO markets on Bitcoin")]
struct Cli {
    /// Directory holding config, keys and market storage.
    #[arg(long, env = "BINMARK_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the current network, or switch to another one.
    Network { network: Option<Network> },
    /// Encrypt and store a WIF signing key for the current network.
    ImportKey {
        #[arg(long, env = "BINMARK_WIF", hide_env_values = true)]
        wif: String,
        #[arg(long, env = "BINMARK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create a market: YES contract, a 65 second wait, then NO contract.
    Create {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        liquidity: String,
        /// YYYY-MM-DD
        #[arg(long)]
        end_date: String,
        /// HH:MM (UTC)
        #[arg(long)]
        end_time: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        image_url: Option<String>,
        #[arg(long, env = "BINMARK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Mint from an existing contract (block:tx) to the signing address.
    Mint {
        contract: ContractId,
        #[arg(long, env = "BINMARK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// List stored markets.
    List {
        #[arg(long, default_value = "")]
        query: String,
        /// none, recent or liquidity
        #[arg(long, default_value = "none")]
        sort: MarketSort,
    },
    /// Show one stored market.
    Show { id: String },
    /// Keep only the newest markets and drop everything else in storage.
    Cleanup,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("binmark")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn unlock_signer(state: &AppStateManager, password: &str) -> Result<KeySigner, AppError> {
    let vault = state.vault();
    if !vault.exists() {
        return Err(AppError::NoKey(state.network().to_string()));
    }
    Ok(vault.unlock(password)?)
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let mut state = AppStateManager::open(data_dir)?;
    if state.is_first_launch() {
        log::info!(
            "no config in {}; using {} defaults",
            state.data_dir().display(),
            state.network()
        );
    }

    match cli.command {
        Command::Network { network: None } => print_json(&state.snapshot()?),
        Command::Network {
            network: Some(network),
        } => print_json(&state.set_network(network)?),
        Command::ImportKey { wif, password } => {
            let signer = state.vault().import(&wif, &password)?;
            println!("{}", signer.address());
            Ok(())
        }
        Command::Create {
            title,
            description,
            liquidity,
            end_date,
            end_time,
            tags,
            image_url,
            password,
        } => {
            let signer = unlock_signer(&state, &password)?;
            let account = signer.account();
            let (orchestrator, rx) = MarketOrchestrator::new(
                state.chain_client(),
                signer,
                state.config().orchestrator_config(),
            );
            let progress = commands::spawn_progress_logger(rx);

            let (handle, token) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupt received; cancelling market creation");
                    handle.cancel();
                }
            });

            let draft = MarketDraft {
                title,
                description,
                liquidity,
                end_date,
                end_time,
                tags,
                image_url,
            };
            let store = state.store();
            let result =
                commands::create_market(&orchestrator, &*store, &account, &draft, &token).await;
            drop(orchestrator);
            let _ = progress.await;
            print_json(&result?)
        }
        Command::Mint { contract, password } => {
            let signer = unlock_signer(&state, &password)?;
            let account = signer.account();
            let (orchestrator, _rx) = MarketOrchestrator::new(
                state.chain_client(),
                signer,
                state.config().orchestrator_config(),
            );
            let txid = orchestrator.mint(&account, contract).await?;
            println!("{txid}");
            Ok(())
        }
        Command::List { query, sort } => {
            print_json(&commands::list_markets(&*state.store(), &query, sort)?)
        }
        Command::Show { id } => print_json(&commands::market_detail(&*state.store(), &id)?),
        Command::Cleanup => {
            let report = commands::cleanup_storage(&*state.store())?;
            println!(
                "kept {} market(s), discarded {}{}",
                report.retained,
                report.discarded,
                if report.wiped { " (storage was reset)" } else { "" }
            );
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    binmark_lib::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
