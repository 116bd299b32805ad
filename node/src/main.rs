use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use vaultline_execution::{
    EarnRequest, Economy, MissionClaim, Mutation, PlayRequest, SystemClock,
};
use vaultline_node::{
    simulate::{self, SimulationPlan},
    Config, LogFormat, ValidatedConfig,
};
use vaultline_types::{EarnIdentity, EarnType, PoolSpec, Reward, TokenKind, UserId};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "vaultline.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and apply the schema.
    Init,
    /// Print a wallet balance and its trial bucket.
    Balance {
        user: UserId,
        token: TokenKind,
    },
    /// Credit tokens, at most once per idempotency key.
    Grant {
        user: UserId,
        token: TokenKind,
        amount: u64,
        #[arg(long, default_value = "ADMIN_GRANT")]
        reason: String,
        /// Tag the grant as trial-origin.
        #[arg(long)]
        trial: bool,
        #[arg(long)]
        key: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Debit tokens for a purchase or play.
    Consume {
        user: UserId,
        token: TokenKind,
        amount: u64,
        #[arg(long, default_value = "PLAY")]
        reason: String,
    },
    /// Administrative debit.
    Revoke {
        user: UserId,
        token: TokenKind,
        amount: u64,
        #[arg(long, default_value = "ADMIN_REVOKE")]
        reason: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Print the ledger for one wallet and its reconciliation.
    History {
        user: UserId,
        token: TokenKind,
    },
    /// Load (or replace) a draw pool from a YAML file.
    PoolLoad {
        file: PathBuf,
    },
    /// Draw once from a pool without touching any wallet.
    Draw {
        pool: String,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Play one round: draw, consume a ticket, credit the vault.
    Play {
        user: UserId,
        pool: String,
        #[arg(long)]
        game: String,
        #[arg(long)]
        ticket: TokenKind,
        #[arg(long, default_value_t = 1)]
        cost: u64,
        #[arg(long)]
        log_id: u64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Record an earn event against a user's vault.
    Earn {
        user: UserId,
        identity: EarnIdentity,
        /// Raw points; ignored when `--reward-kind` is set.
        #[arg(long, default_value_t = 0)]
        amount: u64,
        /// Reward kind to value through the valuation table, e.g. `DIAMOND`.
        #[arg(long)]
        reward_kind: Option<String>,
        #[arg(long, default_value = "GAME_PLAY")]
        earn_type: EarnType,
    },
    /// Print a user's vault.
    Vault {
        user: UserId,
    },
    /// Claim a mission reward, at most once per idempotency key.
    Claim {
        user: UserId,
        mission: String,
        #[arg(long)]
        claim_id: u64,
        #[arg(long)]
        reward_kind: String,
        #[arg(long, default_value_t = 0)]
        reward_amount: u64,
        #[arg(long)]
        key: String,
    },
    /// Run parallel plays against a pool and report outcomes.
    Simulate {
        pool: String,
        #[arg(long, default_value_t = 1_000)]
        plays: u64,
        #[arg(long, default_value_t = 10)]
        users: u64,
        #[arg(long, default_value = "roulette")]
        game: String,
        #[arg(long, default_value = "ROULETTE_TICKET")]
        ticket: TokenKind,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 1)]
        first_log_id: u64,
    },
}

fn init_tracing(level: Level, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Plain => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> Result<ValidatedConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    Config::from_yaml(&contents)
        .context("failed to parse config")?
        .validate()
        .context("invalid config")
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn execute(economy: &Economy, config: &ValidatedConfig, command: Command) -> Result<()> {
    match command {
        Command::Init => print(&json!({ "database": economy.store().path() })),
        Command::Balance { user, token } => {
            let account = economy.ledger().account(user, token)?;
            let bucket = economy.ledger().trial_bucket(user, token)?;
            print(&json!({ "account": account, "trial": bucket }))
        }
        Command::Grant {
            user,
            token,
            amount,
            reason,
            trial,
            key,
            actor,
        } => {
            let mutation = Mutation::new(user, token, amount, reason);
            let execution = economy.grant_once(&actor, &key, mutation, trial)?;
            print(&json!({
                "replayed": execution.is_replay(),
                "response": execution.response(),
            }))
        }
        Command::Consume {
            user,
            token,
            amount,
            reason,
        } => {
            let outcome = economy.ledger().consume(Mutation::new(user, token, amount, reason))?;
            print(&json!({
                "balance": outcome.balance,
                "trial_units": outcome.trial_units,
            }))
        }
        Command::Revoke {
            user,
            token,
            amount,
            reason,
            label,
        } => {
            let mut mutation = Mutation::new(user, token, amount, reason);
            if let Some(label) = label {
                mutation = mutation.with_label(label);
            }
            let balance = economy.ledger().revoke(mutation)?;
            print(&json!({ "balance": balance }))
        }
        Command::History { user, token } => {
            let entries = economy.ledger().entries(user, token)?;
            let reconciliation = economy.ledger().reconcile(user, token)?;
            print(&json!({ "entries": entries, "reconciliation": reconciliation }))
        }
        Command::PoolLoad { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read pool {}", file.display()))?;
            let spec: PoolSpec =
                serde_yaml::from_str(&contents).context("failed to parse pool spec")?;
            let items = economy.draws().load_pool_spec(&spec)?;
            info!(pool = %spec.id, items = items.len(), "pool loaded");
            print(&json!({ "pool": spec.id, "items": items }))
        }
        Command::Draw { pool, seed } => {
            let outcome = economy.draws().resolve(&pool, &mut rng_for(seed))?;
            print(&json!({ "item": outcome.item, "attempts": outcome.attempts }))
        }
        Command::Play {
            user,
            pool,
            game,
            ticket,
            cost,
            log_id,
            seed,
        } => {
            let request = PlayRequest {
                user,
                game,
                pool_id: pool,
                ticket,
                cost,
                log_id,
            };
            print(&economy.play(&request, &mut rng_for(seed))?)
        }
        Command::Earn {
            user,
            identity,
            amount,
            reward_kind,
            earn_type,
        } => {
            let request = EarnRequest::new(user, identity, earn_type);
            match reward_kind {
                Some(kind) => {
                    let reward = Reward::from_descriptor(&kind, amount)?;
                    let request = request.with_payout(serde_json::to_value(&reward)?);
                    let outcome = economy
                        .vault()
                        .record_earn_event_with_valuation(&request, &reward)?;
                    print(&outcome)
                }
                None => {
                    let credited = economy.vault().record_earn_event(&request, amount)?;
                    print(&json!({ "credited": credited }))
                }
            }
        }
        Command::Vault { user } => print(&economy.vault().state(user)?),
        Command::Claim {
            user,
            mission,
            claim_id,
            reward_kind,
            reward_amount,
            key,
        } => {
            let claim = MissionClaim {
                user,
                mission,
                claim_id,
                reward: Reward::from_descriptor(&reward_kind, reward_amount)?,
            };
            let execution = economy.claim_mission(&claim, &key)?;
            print(&json!({
                "replayed": execution.is_replay(),
                "response": execution.response(),
            }))
        }
        Command::Simulate {
            pool,
            plays,
            users,
            game,
            ticket,
            seed,
            first_log_id,
        } => {
            let threads = rayon::ThreadPoolBuilder::new()
                .num_threads(config.worker_threads)
                .build()
                .context("failed to build worker pool")?;
            let plan = SimulationPlan {
                pool_id: pool,
                game,
                ticket,
                plays,
                users,
                seed,
                first_log_id,
            };
            print(&simulate::run(economy, &plan, &threads)?)
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_tracing(config.log_level, config.log_format);
    info!(
        database = %config.database_path.display(),
        config = %args.config.display(),
        "starting vaultline"
    );

    let economy = config
        .open_economy(&args.config, Arc::new(SystemClock))
        .context("failed to open economy store")?;
    if let Err(err) = execute(&economy, &config, args.command) {
        if let Some(economy_err) = err.downcast_ref::<vaultline_execution::EconomyError>() {
            let code = economy_err.code();
            print(&json!({
                "error": code.as_str(),
                "disposition": code.disposition(),
                "message": economy_err.to_string(),
            }))?;
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grant_with_trial_flag() {
        let args = Args::parse_from([
            "vaultline",
            "--config",
            "/tmp/economy.yaml",
            "grant",
            "7",
            "DICE_TICKET",
            "3",
            "--trial",
            "--key",
            "signup-7",
        ]);
        assert_eq!(args.config, PathBuf::from("/tmp/economy.yaml"));
        match args.command {
            Command::Grant {
                user,
                token,
                amount,
                trial,
                key,
                reason,
                actor,
            } => {
                assert_eq!(user, 7);
                assert_eq!(token, TokenKind::DiceTicket);
                assert_eq!(amount, 3);
                assert!(trial);
                assert_eq!(key, "signup-7");
                assert_eq!(reason, "ADMIN_GRANT");
                assert_eq!(actor, "operator");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_earn_identity_and_type() {
        let args = Args::parse_from([
            "vaultline",
            "earn",
            "7",
            "MISSION:DAILY:3",
            "--reward-kind",
            "DIAMOND",
            "--amount",
            "5",
            "--earn-type",
            "MISSION_CLAIM",
        ]);
        assert_eq!(args.config, PathBuf::from("vaultline.yaml"));
        match args.command {
            Command::Earn {
                identity,
                amount,
                reward_kind,
                earn_type,
                ..
            } => {
                assert_eq!(identity.as_str(), "MISSION:DAILY:3");
                assert_eq!(amount, 5);
                assert_eq!(reward_kind.as_deref(), Some("DIAMOND"));
                assert_eq!(earn_type, EarnType::MissionClaim);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_token_kind() {
        assert!(Args::try_parse_from(["vaultline", "balance", "7", "GEMS"]).is_err());
    }

    #[test]
    fn simulate_defaults() {
        let args = Args::parse_from(["vaultline", "simulate", "wheel"]);
        match args.command {
            Command::Simulate {
                plays,
                users,
                ticket,
                ..
            } => {
                assert_eq!(plays, 1_000);
                assert_eq!(users, 10);
                assert_eq!(ticket, TokenKind::RouletteTicket);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
