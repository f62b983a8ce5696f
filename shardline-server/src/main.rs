mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod server;
mod watcher;
use server::run_server;
use shardline_core::{TopologySnapshot, ring_hash};

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Fault-domain aware placement for S3-compatible storage nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the placement service and its admin API
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "shardline.yaml")]
        config: String,
    },
    /// Print where a chunk key lands in every fault domain, ignoring health
    Ring {
        /// Path to configuration file
        #[arg(short, long, default_value = "shardline.yaml")]
        config: String,

        /// Chunk key to place
        key: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardline=info,shardline_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Shardline with config: {}", config);

            let cfg = load_config(&config);
            tracing::info!(
                "Bind: {}, Nodes: {}, Active domains: {:?}, Standby: {:?}",
                cfg.bind_addr,
                cfg.topology.nodes.len(),
                cfg.topology.active_domains,
                cfg.topology.standby_domain
            );

            if let Err(e) = run_server(cfg, config).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Ring { config, key } => {
            let cfg = load_config(&config);
            print_ring_placement(&cfg, &key);
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_ring_placement(config: &Config, key: &str) {
    let snapshot = TopologySnapshot::build(&config.topology, 0);
    println!("key: {} (position {})", key, ring_hash(key));

    let mut domains = snapshot.active_domains().to_vec();
    if let Some(standby) = snapshot.standby_domain() {
        domains.push(standby.to_string());
    }

    for domain in domains {
        match snapshot.ring(&domain) {
            Some(ring) => {
                let primary = ring.get_node(key).unwrap_or_default();
                let order = ring.get_nodes(key, ring.len());
                println!("{:<16} {:<24} failover: {}", domain, primary, order.join(" -> "));
            }
            None => println!("{:<16} (no nodes)", domain),
        }
    }
}
