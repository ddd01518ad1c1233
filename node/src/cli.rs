//! # CLI Interface
//!
//! Command-line arguments for `strata-node`, via `clap` derive. Four
//! subcommands: `run`, `init`, `status`, `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use strata_protocol::config::{DEFAULT_METRICS_PORT, DEFAULT_RPC_PORT};
use strata_protocol::exchange::OptionKind;

/// Strata vault node.
///
/// Hosts epoch-driven option vaults behind a JSON-RPC, REST and WebSocket
/// API, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "strata-node",
    about = "Strata vault node",
    version,
    propagate_version = true
)]
pub struct StrataNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and generate an admin keypair.
    Init(InitArgs),
    /// Query the status of a running node.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory holding the vault database and the admin key.
    #[arg(long, short = 'd', env = "STRATA_DATA_DIR", default_value = ".strata")]
    pub data_dir: PathBuf,

    /// Port for the JSON-RPC, REST and WebSocket API.
    #[arg(long, env = "STRATA_RPC_PORT", default_value_t = DEFAULT_RPC_PORT)]
    pub rpc_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "STRATA_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "STRATA_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Network label reported by `/status`.
    #[arg(long, default_value = "devnet")]
    pub network: String,

    /// Option market to list on the simulated venue at startup, as
    /// `KIND:STRIKE:EXPIRY` (e.g. `put:100000000:1767225600`). Repeatable.
    #[arg(long = "list-market", value_parser = parse_market_listing)]
    pub markets: Vec<MarketListing>,

    /// Seconds between registry sweeps (gauges, stale-epoch warnings).
    #[arg(long, default_value_t = 10)]
    pub sweep_interval_secs: u64,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "STRATA_DATA_DIR", default_value = ".strata")]
    pub data_dir: PathBuf,

    /// Overwrite an existing admin key.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// API endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:9841")]
    pub rpc_url: String,
}

/// A market to list on the simulated venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketListing {
    pub kind: OptionKind,
    pub strike: u64,
    pub expiry: i64,
}

/// Parses `KIND:STRIKE:EXPIRY`.
pub fn parse_market_listing(s: &str) -> Result<MarketListing, String> {
    let mut parts = s.split(':');
    let (Some(kind), Some(strike), Some(expiry), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected KIND:STRIKE:EXPIRY, got {s:?}"));
    };
    let kind = match kind.to_ascii_lowercase().as_str() {
        "call" => OptionKind::Call,
        "put" => OptionKind::Put,
        other => return Err(format!("unknown option kind {other:?}")),
    };
    let strike: u64 = strike
        .parse()
        .map_err(|e| format!("bad strike {strike:?}: {e}"))?;
    if strike == 0 {
        return Err("strike must be positive".into());
    }
    let expiry: i64 = expiry
        .parse()
        .map_err(|e| format!("bad expiry {expiry:?}: {e}"))?;
    Ok(MarketListing {
        kind,
        strike,
        expiry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        StrataNodeCli::command().debug_assert();
    }

    #[test]
    fn parses_market_listing() {
        assert_eq!(
            parse_market_listing("PUT:100000000:1767225600").unwrap(),
            MarketListing {
                kind: OptionKind::Put,
                strike: 100_000_000,
                expiry: 1_767_225_600,
            }
        );
        assert!(parse_market_listing("put:100").is_err());
        assert!(parse_market_listing("straddle:1:2").is_err());
        assert!(parse_market_listing("call:0:2").is_err());
        assert!(parse_market_listing("call:1:2:3").is_err());
    }

    #[test]
    fn run_args_accept_repeated_markets() {
        let cli = StrataNodeCli::parse_from([
            "strata-node",
            "run",
            "--list-market",
            "put:5:10",
            "--list-market",
            "call:7:10",
            "--rpc-port",
            "19841",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.markets.len(), 2);
        assert_eq!(args.rpc_port, 19841);
        assert_eq!(args.markets[1].kind, OptionKind::Call);
    }
}
