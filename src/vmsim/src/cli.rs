use std::{path::PathBuf, str::FromStr};

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use logger::LevelFilter;
use mm::{kernel, Kernel, MmConfig};

use crate::workload::{self, Options, Report, Workload};

pub fn cli_main() -> anyhow::Result<()> {
    let matches = Command::new("vmsim")
        .about("Runs workloads against a simulated virtual memory manager")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .takes_value(true)
                .help("JSON file with memory settings"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .takes_value(true)
                .help("off, error, warn, info, debug or trace"),
        )
        .arg(
            Arg::new("frames")
                .long("frames")
                .takes_value(true)
                .help("Number of frames in the pool"),
        )
        .arg(
            Arg::new("pages")
                .long("pages")
                .default_value("16")
                .takes_value(true)
                .help("Pages touched by each workload"),
        )
        .arg(
            Arg::new("file")
                .long("file")
                .takes_value(true)
                .help("Host file backing the file workloads"),
        )
        .arg(Arg::new("json").long("json").help("Print reports as JSON"))
        .arg(
            Arg::new("workload")
                .default_value("all")
                .possible_values(["all", "demand", "cow", "shared", "threads"]),
        )
        .get_matches();

    init_logger(matches.value_of("log-level"))?;
    let config = load_config(&matches)?;
    let opts = Options {
        pages: parse_number(&matches, "pages")?,
        file: matches.value_of("file").map(PathBuf::from),
    };
    let workloads = match matches.value_of("workload") {
        Some("all") | None => Workload::ALL.to_vec(),
        Some(name) => vec![name.parse()?],
    };

    let vm = kernel::init(Kernel::load(config)?)?;
    for w in workloads {
        let report = workload::run(vm.context(), w, &opts)
            .with_context(|| format!("workload {} failed", w.name()))?;
        print_report(&report, matches.is_present("json"))?;
    }
    kernel::teardown()
}

fn init_logger(level: Option<&str>) -> anyhow::Result<()> {
    let res = match level {
        Some(level) => logger::init(LevelFilter::from_str(level).unwrap_or(LevelFilter::Off)),
        None => logger::init_from_env("VMSIM_LOG_LEVEL", LevelFilter::Warn),
    };
    res.map_err(|_| anyhow::anyhow!("failed to set log level"))
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<MmConfig> {
    let mut config = match matches.value_of("config") {
        Some(path) => MmConfig::load(path)?,
        None => MmConfig::default(),
    };
    if matches.is_present("frames") {
        config.frames = parse_number(matches, "frames")?;
    }
    Ok(config)
}

fn parse_number(matches: &ArgMatches, name: &str) -> anyhow::Result<u64> {
    let value = matches.value_of(name).unwrap_or_default();
    value
        .parse()
        .with_context(|| format!("invalid value {:?} for --{}", value, name))
}

fn print_report(report: &Report, json: bool) -> anyhow::Result<()> {
    if json {
        let s = serde_json::to_string(report).context("failed to serialize report")?;
        println!("{}", s);
        return Ok(());
    }
    let stats = &report.stats;
    println!(
        "{:<8} virt={:#x} phys={:#x} shared={:#x} tables={} faults(soft={} hard={} cow={}) cache={} frames={}",
        report.workload,
        stats.virtual_size,
        stats.physical_size,
        stats.shared_size,
        stats.table_pages,
        stats.soft_faults,
        stats.hard_faults,
        stats.cow_faults,
        report.cache_pages,
        report.frames_allocated,
    );
    Ok(())
}
