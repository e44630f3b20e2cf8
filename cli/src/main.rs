use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;

use hongbao_allocator::{
    AllocatorConfig, Claimant, ClaimOutcome, HongbaoConfig, PacketRecord, PacketService, PacketSnapshot, UserId,
};
use hongbao_partition::{generate, Amount};
use hongbao_store::{LatencyStore, MemoryStore};

/// Hongbao lucky-money CLI
#[derive(Parser)]
#[command(name = "hongbao", version, about = "Lucky-money packet splitting and claiming")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a fund into random shares and print them
    Split {
        /// Total fund, e.g. 88.88
        #[arg(long)]
        fund: Amount,

        /// Number of shares
        #[arg(long)]
        shares: u32,

        /// RNG seed for a reproducible split
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Create a packet and race concurrent claimants against it
    Simulate {
        /// Total fund, e.g. 88.88
        #[arg(long)]
        fund: Amount,

        /// Number of shares
        #[arg(long)]
        shares: u32,

        /// Number of concurrent claimants (defaults to the share count)
        #[arg(long)]
        grabbers: Option<u32>,

        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// RNG seed, overriding the config file
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Configuration file commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a config file populated with defaults
    Init {
        /// Output path for the TOML file
        #[arg(long, default_value = "hongbao.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Split { fund, shares, seed } => cmd_split(fund, shares, seed),
        Commands::Simulate {
            fund,
            shares,
            grabbers,
            config,
            seed,
        } => cmd_simulate(fund, shares, grabbers.unwrap_or(shares), config, seed).await,
        Commands::Config { command } => match command {
            ConfigCommands::Init { output } => cmd_config_init(output),
        },
        Commands::Version => cmd_version(),
    }
}

fn cmd_split(fund: Amount, shares: u32, seed: Option<u64>) {
    AllocatorConfig::default()
        .check_share_count(shares as usize)
        .unwrap_or_else(|e| {
            eprintln!("Error splitting fund: {e}");
            std::process::exit(1);
        });

    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let split = generate(fund, shares, &mut rng).unwrap_or_else(|e| {
        eprintln!("Error splitting fund: {e}");
        std::process::exit(1);
    });

    let best = split.iter().copied().max().unwrap_or(Amount::ZERO);
    println!("Split {fund} into {shares} shares");
    for (i, share) in split.iter().enumerate() {
        let marker = if *share == best { "  (best)" } else { "" };
        println!("  #{:<4} {:>12}{marker}", i + 1, share.to_string());
    }
    let total: Amount = split.iter().sum();
    println!("  Total: {total}");
}

async fn cmd_simulate(
    fund: Amount,
    shares: u32,
    grabbers: u32,
    config_path: Option<PathBuf>,
    seed: Option<u64>,
) {
    let mut config = match config_path {
        Some(path) => HongbaoConfig::from_file(&path).unwrap_or_else(|e| {
            eprintln!("Error reading config file: {e}");
            std::process::exit(1);
        }),
        None => HongbaoConfig::default(),
    };
    if seed.is_some() {
        config.rng_seed = seed;
    }

    let store = LatencyStore::from_config(MemoryStore::<PacketRecord>::new(), &config.store);
    let mut service = PacketService::new(store, config.allocator.clone());
    if let Some(s) = config.rng_seed {
        service = service.with_seed(s);
    }
    let service = Arc::new(service);

    let packet = service
        .create_packet(fund, shares, "Best wishes", UserId::from("host"))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error creating packet: {e}");
            std::process::exit(1);
        });
    tracing::info!(%packet, grabbers, "racing claimants");

    let handles: Vec<_> = (1..=grabbers)
        .map(|i| {
            let service = service.clone();
            let packet = packet.clone();
            tokio::spawn(async move {
                let who = Claimant::new(format!("guest-{i:03}"))
                    .with_display_name(format!("Guest {i}"));
                service.claim(&packet, &who).await
            })
        })
        .collect();

    let mut granted = 0u32;
    let mut exhausted = 0u32;
    let mut failed = 0u32;
    for handle in handles {
        match handle.await {
            Ok(Ok(ClaimOutcome::Granted(_))) => granted += 1,
            Ok(Ok(ClaimOutcome::AlreadyClaimed(_))) => {}
            Ok(Ok(ClaimOutcome::Exhausted)) => exhausted += 1,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "claim failed");
                failed += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "claim task panicked");
                failed += 1;
            }
        }
    }

    let snapshot = service.status(&packet).await.unwrap_or_else(|e| {
        eprintln!("Error reading packet: {e}");
        std::process::exit(1);
    });
    print_snapshot(&snapshot);

    let stats = service.store().inner().stats();
    println!("Outcomes");
    println!("  Granted: {granted}");
    println!("  Exhausted: {exhausted}");
    println!("  Failed: {failed}");
    println!("Store");
    println!("  Reads: {}", stats.reads);
    println!("  Commits: {}", stats.commits);
    println!("  Conflicts: {}", stats.conflicts);

    let expected = shares.min(grabbers) as usize;
    if snapshot.claims.len() != expected || (snapshot.is_finished() && snapshot.claimed_total != fund)
    {
        eprintln!(
            "Accounting mismatch: {} claims totalling {}, expected {expected}",
            snapshot.claims.len(),
            snapshot.claimed_total
        );
        std::process::exit(1);
    }
}

fn print_snapshot(snapshot: &PacketSnapshot) {
    println!("Packet {}", snapshot.id);
    println!("  Fund: {}", snapshot.fund);
    println!("  Shares: {} ({} left)", snapshot.share_count, snapshot.shares_left);
    println!("  Claimed: {}", snapshot.claimed_total);
    println!("  State: {:?}", snapshot.state);
    for claim in &snapshot.claims {
        let marker = if claim.is_best_share { "  (best)" } else { "" };
        println!(
            "  {:<12} {:>12}  {}{marker}",
            claim.display_name,
            claim.amount.to_string(),
            claim.claimed_at.format("%H:%M:%S%.3f")
        );
    }
}

fn cmd_config_init(output: PathBuf) {
    let config = HongbaoConfig::default();
    config.to_file(&output).unwrap_or_else(|e| {
        eprintln!("Error writing config file: {e}");
        std::process::exit(1);
    });

    println!("Config file created: {}", output.display());
    println!("  Max attempts: {}", config.allocator.max_attempts);
    println!("  Max share count: {}", config.allocator.max_share_count);
    println!("  Store latency: {} us", config.store.latency_us);
}

fn cmd_version() {
    println!("hongbao {} (lucky-money CLI)", env!("CARGO_PKG_VERSION"));
}
