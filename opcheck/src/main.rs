use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use tracing::debug;

use opcheck::args::{materialize, CallArgs, HostTensorFactory, Materialized};
use opcheck::catalog;
use opcheck::check::CheckOutcome;
use opcheck::config::SearchConfig;
use opcheck::diag::{tabulate, unused_index_warnings};
use opcheck::schema::OpSchema;

#[derive(Parser, Debug)]
#[command(
    name = "opcheck",
    version,
    about = "Op argument checker — validates tensor op arguments against declarative schemas"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Search settings file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Largest edit distance searched for fixes
    #[arg(long, global = true)]
    max_dist: Option<u32>,

    /// Generation seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Mutations allowed per generated case
    #[arg(long, global = true)]
    edits: Option<u32>,

    /// Log search progress
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List catalog operations
    List,
    /// Show an operation's declarations and its valid combinations
    Explain { op: String },
    /// Check one call, given as name=value pairs
    Check {
        op: String,
        /// Argument value (repeatable), e.g. input=tensor:float32:[2,8,8,3]
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    /// Print generated calls
    Generate {
        op: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
        /// Allocate host tensors for each case and report their element counts
        #[arg(long)]
        materialize: bool,
    },
    /// Check generated calls and tally the outcomes
    Validate {
        op: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("opcheck: error: {msg}");
    exit(2);
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> SearchConfig {
    let mut config = match &cli.config {
        Some(path) => SearchConfig::load(path).unwrap_or_else(|e| fail(e)),
        None => SearchConfig::default(),
    };
    if let Some(d) = cli.max_dist {
        config.max_search_dist = d;
    }
    if let Some(s) = cli.seed {
        config.seed = s;
    }
    if let Some(e) = cli.edits {
        config.test_edits = e;
    }
    config
}

fn schema(op: &str) -> OpSchema {
    match catalog::lookup(op) {
        Some(Ok(s)) => s,
        Some(Err(e)) => fail(format!("{op}: {e}")),
        None => fail(format!("unknown op '{op}' (see `opcheck list`)")),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| fail(e))
}

fn materialized_summary(args: &CallArgs) -> String {
    match materialize(args, &mut HostTensorFactory::default()) {
        Ok(values) => values
            .iter()
            .map(|(name, m)| match m {
                Materialized::Tensor(t) => format!("{name}={} elems", t.data.len()),
                Materialized::Value(v) => format!("{name}={v}"),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Err(e) => format!("not materialised: {e}"),
    }
}

fn explain(s: &OpSchema, config: &SearchConfig) {
    println!("{}", s.explain());
    for w in unused_index_warnings(s.def()) {
        eprintln!("opcheck: {w}");
    }
    let rows = s.inventory(config).unwrap_or_else(|e| fail(e));
    let mut table = vec![vec![
        "layout".to_string(),
        "ranks".to_string(),
        "signatures".to_string(),
        "dtypes".to_string(),
    ]];
    for row in &rows {
        let ranks: Vec<String> = row.ranks.iter().map(|(c, r)| format!("{c}={r}")).collect();
        let sigs: Vec<String> = row.sigs.iter().map(|(k, sig)| format!("{k}:{sig}")).collect();
        let dtypes: Vec<String> = row.dtypes.iter().map(|(t, d)| format!("{t}:{d}")).collect();
        table.push(vec![
            row.layout.to_string(),
            ranks.join(" "),
            sigs.join(" "),
            dtypes.join(" "),
        ]);
    }
    println!("inventory ({} combinations):", rows.len());
    print!("{}", tabulate(&table));
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let config = load_config(&cli);
    debug!(?config, "settings");

    match &cli.command {
        Command::List => {
            for name in catalog::names() {
                println!("{name}");
            }
        }
        Command::Explain { op } => explain(&schema(op), &config),
        Command::Check { op, args } => {
            let s = schema(op);
            let mut call = CallArgs::new();
            for pair in args {
                call.push_cli(pair).unwrap_or_else(|e| fail(e));
            }
            let outcome = s.check_args(&call, &config).unwrap_or_else(|e| fail(e));
            print!("{}", outcome.render(s.op_path(), &call));
            if !matches!(outcome, CheckOutcome::Valid(_)) {
                exit(1);
            }
        }
        Command::Generate {
            op,
            limit,
            json,
            materialize,
        } => {
            let s = schema(op);
            let cases = s.generate_args(&config).unwrap_or_else(|e| fail(e));
            for case in cases.take(limit.unwrap_or(usize::MAX)) {
                let case = case.unwrap_or_else(|e| fail(e));
                if *materialize {
                    println!("[{}] {}", case.mutations, materialized_summary(&case.args));
                } else if *json {
                    println!("{}", to_json(&case));
                } else {
                    println!("[{}] {}", case.mutations, case.args);
                }
            }
        }
        Command::Validate { op, limit, json } => {
            let s = schema(op);
            let tally = s.validate(&config, *limit).unwrap_or_else(|e| fail(e));
            if *json {
                println!("{}", to_json(&tally));
            } else {
                print!(
                    "{}",
                    tabulate(&[
                        vec!["TN".into(), "TP".into(), "FP".into(), "FN".into(), "cost mismatch".into()],
                        vec![
                            tally.true_neg.to_string(),
                            tally.true_pos.to_string(),
                            tally.false_pos.to_string(),
                            tally.false_neg.to_string(),
                            tally.cost_mismatch.to_string(),
                        ],
                    ])
                );
            }
            if tally.false_pos + tally.false_neg > 0 {
                exit(1);
            }
        }
    }
}
