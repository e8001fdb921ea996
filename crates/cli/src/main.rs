use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "capflow")]
#[command(about = "Automated trading control loop for derivative markets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a raw-event JSONL file through the metric engine and
    /// orchestrator with simulated (paper) fills
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        /// JSONL file of raw market events, one per line
        #[arg(long)]
        events: PathBuf,
        /// Persist planned trades to PostgreSQL instead of memory
        #[arg(long, default_value_t = false)]
        postgres: bool,
    },
    /// Run a backtest over per-symbol CSV minute bars
    Backtest {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        /// Directory holding <SYMBOL>.csv bar files
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,
        /// Symbols to replay
        #[arg(long, required = true)]
        symbols: Vec<String>,
        /// Percent of equity risked per trade
        #[arg(long)]
        risk_pct: Option<f64>,
        /// Hard-stop drawdown limit, percent of starting equity
        #[arg(long)]
        max_dd: Option<f64>,
        /// Daily soft stop in account currency
        #[arg(long)]
        daily_stop: Option<f64>,
        /// Output CSV for closed trades
        #[arg(long, default_value = "trades.csv")]
        trades_out: PathBuf,
        /// Output JSON for summary stats
        #[arg(long, default_value = "stats.json")]
        stats_out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run {
            config,
            events,
            postgres,
        } => commands::run_replay(&config, &events, postgres).await,
        Commands::Backtest {
            config,
            data_dir,
            symbols,
            risk_pct,
            max_dd,
            daily_stop,
            trades_out,
            stats_out,
        } => {
            commands::run_backtest_cmd(
                &config,
                &data_dir,
                &symbols,
                commands::RiskOverrides {
                    risk_pct,
                    max_dd,
                    daily_stop,
                },
                &trades_out,
                &stats_out,
            )
        }
    }
}
