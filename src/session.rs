/// One measurement session: environment snapshot, every enabled tool run
/// sequentially N times, then assembly into a single record.
use crate::adapters::network_quality::NetworkQualityAdapter;
use crate::adapters::ping::PingAdapter;
use crate::adapters::speedtest::SpeedtestAdapter;
use crate::config::Config;
use crate::environment;
use crate::invoker::{CommandSpec, Invoke};
use crate::record::{self, SessionRecord};
use crate::runner::{SampleRunner, ToolRun};
use chrono::Local;
use std::time::Duration;

/// Exit codes ping uses for "ran, but some or all replies were lost".
const PING_SUCCESS_CODES: &[i32] = &[0, 1, 2];

/// Result of a session: the record plus raw outputs kept for `--print-raw`.
pub struct SessionOutput {
    pub record: SessionRecord,
    pub runs: Vec<ToolRun>,
}

fn speedtest_command(config: &Config) -> CommandSpec {
    let st = &config.speedtest;
    let mut args = st.args.clone();
    if let Some(id) = st.server_id.as_deref().filter(|s| !s.is_empty()) {
        args.push("-s".to_string());
        args.push(id.to_string());
    }
    CommandSpec::new(&st.command, args, Duration::from_secs(st.timeout_secs))
}

fn network_quality_command(config: &Config) -> CommandSpec {
    let nq = &config.network_quality;
    CommandSpec::new(&nq.command, nq.args.clone(), Duration::from_secs(nq.timeout_secs))
}

fn ping_command(config: &Config, target: &str) -> CommandSpec {
    let p = &config.ping;
    CommandSpec::new(
        &p.command,
        vec![
            "-n".to_string(),
            "-c".to_string(),
            p.count.to_string(),
            target.to_string(),
        ],
        Duration::from_secs(p.timeout_secs),
    )
    .with_success_codes(PING_SUCCESS_CODES)
}

/// Strip a `:port` suffix (but leave bare IPv6 addresses alone).
fn host_without_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

/// Ping targets, with the selected speedtest server first when requested.
fn ping_targets(config: &Config, speedtest: Option<&ToolRun>) -> Vec<String> {
    let mut targets = config.ping.targets.clone();
    if config.ping.include_speedtest_server {
        let server = speedtest
            .and_then(|run| run.records.first())
            .and_then(|r| r.metadata.get("server_host"))
            .map(|h| host_without_port(h).to_string());
        match server {
            Some(host) if !targets.contains(&host) => targets.insert(0, host),
            Some(_) => {}
            None => tracing::info!("speedtest server host unknown, not adding ping target"),
        }
    }
    targets
}

/// Run the whole session. Individual tool failures are absorbed here.
pub async fn run<I: Invoke>(invoker: &I, config: &Config) -> SessionOutput {
    let started_at = Local::now().fixed_offset();
    let runs_per_tool = config.session.runs;
    let pause = config.sleep_between();

    tracing::info!(runs = runs_per_tool, "session starting");

    let env = environment::collect(invoker, &config.environment).await;

    let mut runs: Vec<ToolRun> = Vec::new();

    let speedtest = SpeedtestAdapter::new();
    if config.speedtest.enabled {
        let run = SampleRunner::new(invoker, &speedtest, speedtest_command(config), runs_per_tool)
            .with_sleep_between(pause)
            .run()
            .await;
        runs.push(run);
    } else {
        runs.push(ToolRun::disabled("speedtest", None));
    }

    let network_quality = NetworkQualityAdapter::new();
    if config.network_quality.enabled {
        let run = SampleRunner::new(
            invoker,
            &network_quality,
            network_quality_command(config),
            runs_per_tool,
        )
        .with_sleep_between(pause)
        .run()
        .await;
        runs.push(run);
    } else {
        runs.push(ToolRun::disabled("network_quality", None));
    }

    let ping = PingAdapter::new();
    if config.ping.enabled {
        let targets = ping_targets(config, runs.first().filter(|r| r.tool == "speedtest"));
        for target in targets {
            let run = SampleRunner::new(invoker, &ping, ping_command(config, &target), runs_per_tool)
                .with_target(target)
                .with_sleep_between(pause)
                .run()
                .await;
            runs.push(run);
        }
    } else {
        runs.push(ToolRun::disabled("ping", None));
    }

    let record = record::assemble(started_at, env, &runs, config);
    tracing::info!(tools = record.tools.len(), "session assembled");
    SessionOutput { record, runs }
}
