use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use std::process;

use netrecon::{
    config::{DiscoveryMethod, ScanConfig},
    network::{PortState, Protocol},
    output::{render, ReportFormat, ScanReport},
    scanner::ReconEngine,
};

fn build_cli() -> Command {
    Command::new("netrecon")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Concurrent network reconnaissance: discovery, port scanning, fingerprinting and topology")
        .arg(
            Arg::new("target")
                .short('t')
                .long("target")
                .value_name("CIDR")
                .help("Target network (CIDR, address, or comma separated list)"),
        )
        .arg(
            Arg::new("ports")
                .short('p')
                .long("ports")
                .value_name("PORTS")
                .help("Ports to scan (e.g. 1-1024, 22,80,443, 1-100,8080)"),
        )
        .arg(
            Arg::new("interface")
                .short('i')
                .long("interface")
                .value_name("IFACE")
                .help("Network interface used for ARP discovery"),
        )
        .arg(
            Arg::new("vuln")
                .short('v')
                .long("vuln")
                .help("Run vulnerability scripts during fingerprinting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("evade")
                .short('e')
                .long("evade")
                .help("Randomize probe order and add jittered delays")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan-type")
                .short('s')
                .long("scan-type")
                .value_name("PROTOCOLS")
                .help("Protocols to probe (tcp, udp, icmp; comma separated)")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("report-format")
                .short('r')
                .long("report-format")
                .value_name("FORMAT")
                .help("Report format")
                .value_parser(["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write the report to FILE instead of stdout"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("COUNT")
                .help("Number of concurrent scan workers")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Per-probe timeout in milliseconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("discovery")
                .long("discovery")
                .value_name("METHOD")
                .help("Host discovery method")
                .value_parser(["arp", "connect"]),
        )
        .arg(
            Arg::new("no-fingerprint")
                .long("no-fingerprint")
                .help("Skip service fingerprinting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Load configuration from a TOML file (default: ~/.netrecon.toml)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .help("Increase log verbosity (repeat for more)")
                .action(ArgAction::Count),
        )
}

fn init_logging(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

/// File config first, then every flag given on the command line
fn resolve_config(matches: &ArgMatches) -> anyhow::Result<ScanConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ScanConfig::from_toml_file(path).with_context(|| format!("loading {}", path))?,
        None => ScanConfig::load_default_config().context("loading default config")?,
    };

    if let Some(target) = matches.get_one::<String>("target") {
        config.target_network = target.clone();
    }
    if let Some(ports) = matches.get_one::<String>("ports") {
        config.port_range = ports.clone();
    }
    if let Some(interface) = matches.get_one::<String>("interface") {
        config.interface = Some(interface.clone());
    }
    if let Some(protocols) = matches.get_many::<String>("scan-type") {
        config.protocols = protocols
            .map(|p| p.parse::<Protocol>())
            .collect::<Result<Vec<_>, _>>()
            .context("parsing --scan-type")?;
    }
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.worker_count = *workers;
    }
    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        config.probe_timeout_ms = *timeout;
    }
    if let Some(method) = matches.get_one::<String>("discovery") {
        config.discovery = method.parse::<DiscoveryMethod>()?;
    }
    if matches.get_flag("vuln") {
        config.vuln_scan = true;
    }
    if matches.get_flag("evade") {
        config.evasion = true;
    }
    if matches.get_flag("no-fingerprint") {
        config.service_detection = false;
    }

    Ok(config)
}

fn print_summary(report: &ScanReport) {
    let status = if report.cancelled {
        "[~] Scan interrupted".bright_yellow()
    } else {
        "[✓] Scan complete".bright_green()
    };
    eprintln!(
        "{} {} in {:.2}s",
        status,
        report.target_network.bright_cyan(),
        report.duration.as_secs_f64()
    );
    eprintln!(
        "{} {} hosts, {} open, {} closed, {} filtered",
        "[>]".bright_blue(),
        report.hosts.len().to_string().bold(),
        report.stats.open.to_string().bright_green(),
        report.stats.closed,
        report.stats.filtered
    );
    for host in report.hosts.iter().filter(|h| !h.open_ports.is_empty()) {
        let ports: Vec<String> = host.open_ports.iter().map(|p| p.to_string()).collect();
        eprintln!("    {} {}", host.address.to_string().bright_cyan(), ports.join(", "));
    }
    let errored = report
        .hosts
        .iter()
        .flat_map(|h| h.ports.iter())
        .filter(|p| p.state == PortState::Filtered && p.error.is_some())
        .count();
    if errored > 0 {
        eprintln!("{} {} probes failed and were recorded as filtered", "[!]".bright_yellow(), errored);
    }
}

async fn run(matches: ArgMatches) -> anyhow::Result<()> {
    let config = resolve_config(&matches)?;
    let format: ReportFormat = matches
        .get_one::<String>("report-format")
        .map(|f| f.parse())
        .transpose()?
        .unwrap_or(ReportFormat::Text);

    let engine = ReconEngine::new(config);
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "[!] Interrupted, finishing in-flight probes".bright_yellow());
            cancel.cancel();
        }
    });

    let report = engine.run().await.context("scan failed")?;
    let rendered = render(&report, format)?;

    match matches.get_one::<String>("output") {
        Some(path) => {
            std::fs::write(path, &rendered).with_context(|| format!("writing report to {}", path))?;
            eprintln!("{} Report written to {}", "[+]".bright_green(), path.bright_cyan());
        }
        None => println!("{}", rendered),
    }

    print_summary(&report);
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();
    init_logging(matches.get_count("verbose"));

    if let Err(e) = run(matches).await {
        eprintln!("{} {:#}", "[!] Error:".bright_red(), e);
        process::exit(1);
    }
}
