mod adapters;
mod aggregate;
mod config;
mod environment;
mod invoker;
mod persist;
mod record;
mod report;
mod runner;
mod session;

use clap::Parser;
use config::Config;
use invoker::ProcessInvoker;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "net-speedtest", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "net-speedtest.toml")]
    config: PathBuf,

    /// Samples per tool (overrides config)
    #[arg(short = 'n', long)]
    runs: Option<u32>,

    /// Skip the throughput tester
    #[arg(long)]
    no_speedtest: bool,

    /// Skip the responsiveness tester
    #[arg(long)]
    no_network_quality: bool,

    /// Skip ping
    #[arg(long)]
    no_ping: bool,

    /// Pin the throughput tester to a server id
    #[arg(long)]
    server_id: Option<String>,

    /// Also ping the server the throughput tester selected
    #[arg(long)]
    ping_speedtest_server: bool,

    /// Extra ping target, added to the configured ones (repeatable)
    #[arg(long = "ping-target", value_name = "HOST")]
    ping_targets: Vec<String>,

    /// Echo requests per ping run
    #[arg(long)]
    ping_count: Option<u32>,

    /// Skip the public IP / ISP lookup
    #[arg(long)]
    no_ipinfo: bool,

    /// Per-invocation timeout in seconds, applied to every tool
    #[arg(long)]
    timeout: Option<u64>,

    /// Seconds to pause between runs of the same tool
    #[arg(long)]
    sleep_between: Option<f64>,

    /// JSONL output path (overrides config)
    #[arg(long)]
    jsonl: Option<PathBuf>,

    /// Human-readable log path (overrides config)
    #[arg(long)]
    log: Option<PathBuf>,

    /// Don't print the summary to stdout
    #[arg(short, long)]
    quiet: bool,

    /// Print raw tool output of successful runs
    #[arg(long)]
    print_raw: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (state transitions, invocations)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(runs) = self.runs {
            config.session.runs = runs;
        }
        if let Some(secs) = self.sleep_between {
            config.session.sleep_between_secs = secs;
        }
        if self.no_speedtest {
            config.speedtest.enabled = false;
        }
        if self.no_network_quality {
            config.network_quality.enabled = false;
        }
        if self.no_ping {
            config.ping.enabled = false;
        }
        if let Some(id) = &self.server_id {
            config.speedtest.server_id = Some(id.clone());
        }
        if self.ping_speedtest_server {
            config.ping.include_speedtest_server = true;
        }
        for target in &self.ping_targets {
            if !config.ping.targets.contains(target) {
                config.ping.targets.push(target.clone());
            }
        }
        if let Some(count) = self.ping_count {
            config.ping.count = count;
        }
        if self.no_ipinfo {
            config.environment.public_ip_lookup = false;
        }
        if let Some(secs) = self.timeout {
            config.set_all_timeouts(secs);
        }
        if let Some(path) = &self.jsonl {
            config.output.jsonl = path.clone();
        }
        if let Some(path) = &self.log {
            config.output.log = path.clone();
        }
        if self.quiet {
            config.output.quiet = true;
        }
        if self.print_raw {
            config.output.print_raw = true;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "net_speedtest=debug"
    } else {
        "net_speedtest=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        return ExitCode::from(2);
    }

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(text) => print!("{text}"),
            Err(e) => {
                eprintln!("error: failed to render config: {e}");
                return ExitCode::from(2);
            }
        }
        return ExitCode::SUCCESS;
    }

    let output = session::run(&ProcessInvoker, &config).await;
    let human = report::render(&output.record);

    if !config.output.quiet {
        println!("{human}");
    }
    if config.output.print_raw {
        for run in &output.runs {
            for (i, raw) in run.raw_outputs.iter().enumerate() {
                let label = match &run.target {
                    Some(t) => format!("{} {}", run.tool, t),
                    None => run.tool.to_string(),
                };
                println!("--- raw {label} run {} ---\n{}", i + 1, raw.trim_end());
            }
        }
    }

    if let Err(e) = persist::persist(
        &config.output.jsonl,
        &config.output.log,
        &output.record,
        &human,
    ) {
        eprintln!("error: {e}");
        return ExitCode::from(1);
    }

    if !config.output.quiet {
        println!("Saved JSONL: {}", config.output.jsonl.display());
        println!("Saved log:   {}", config.output.log.display());
    }
    ExitCode::SUCCESS
}
