use indicatif::{ProgressBar, ProgressStyle};

use crate::SimulateArguments;
use crate::config::Config;
use crate::processors::simulate::{self, Devices};
use crate::util::{format_size, read_file};

pub async fn process(config: &Config, args: SimulateArguments) -> anyhow::Result<()> {
    match config.erase_size()? {
        4096 => process_with::<1024>(config, args).await,
        65536 => process_with::<16384>(config, args).await,
        other => Err(anyhow::anyhow!("Unsupported erase size {other}, expected 4096 or 65536")),
    }
}

async fn process_with<const W: usize>(config: &Config, args: SimulateArguments) -> anyhow::Result<()> {
    let package = read_file(&args.package_path)?;
    let devices = Devices::<W>::load(config, &args.flash_dir)?;

    if let Some(runs) = args.sweep {
        return sweep(config, &devices, &package, runs, args.seed).await;
    }

    let (after, report) = simulate::run(config, devices.clone(), &package, args.cut_at).await?;

    if report.interrupted {
        println!("Power cut after {} bytes, device rebooted", report.consumed);
    } else {
        println!("Update cycle touched {} bytes", report.consumed);
    }
    println!("Booting {}", report.target);
    if let Some(fallback) = report.fallback {
        println!("Fallback {fallback}");
    }
    if let Some(record) = &report.record {
        println!("Record: {:?} ({:?}, {} failed attempts)", record.state, record.outcome, record.attempts);
    }
    if let Some(installed) = &report.installed {
        println!(
            "Installed: version {} built at {}, {}",
            installed.version,
            installed.timestamp,
            format_size(installed.len)
        );
    }

    simulate::check(config, &devices, &after, &package, &report)?;

    if args.dry_run {
        log::info!("Dry run, flash dumps left untouched");
    } else {
        after.save(&args.flash_dir)?;
        log::info!("Saved flash dumps to {}", args.flash_dir.display());
    }
    Ok(())
}

async fn sweep<const W: usize>(
    config: &Config,
    devices: &Devices<W>,
    package: &[u8],
    runs: usize,
    seed: u64,
) -> anyhow::Result<()> {
    let bar = ProgressBar::new(runs as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg:.green.bold} {spinner} {percent:>3}% [{bar:20}] {pos}/{len} (ETA {eta})")?
            .progress_chars("##-"),
    );
    bar.set_message("Cutting power");

    let report = simulate::sweep(config, devices, package, runs, seed, |_| bar.inc(1)).await?;
    bar.finish();

    println!(
        "{} runs over {} bytes: {} updated, {} rolled back, {} failed",
        report.runs,
        report.total,
        report.updated,
        report.rolled_back,
        report.failures.len()
    );

    for (cut, failure) in &report.failures {
        log::error!("Cut at {cut}: {failure}");
    }
    if !report.failures.is_empty() {
        return Err(anyhow::anyhow!("{} power cuts left the device unbootable", report.failures.len()));
    }
    Ok(())
}
