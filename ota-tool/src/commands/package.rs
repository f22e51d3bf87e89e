use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ota_engine::header::HEADER_SIZE;

use crate::PackageArguments;
use crate::config::Config;
use crate::processors::{objcopy, package as processor};
use crate::util::{format_size, read_file, write_file};

pub fn package(config: &Config, args: PackageArguments) -> anyhow::Result<()> {
    let body = objcopy::flatten(&read_file(&args.input_path)?)?;

    let target = args.target.clone().unwrap_or_else(|| config.roles.app.clone());
    let app = config.partition(&target)?;
    if body.len() > app.len as usize {
        return Err(anyhow::anyhow!(
            "Image of {} bytes does not fit {target} of {}",
            body.len(),
            format_size(app.len)
        ));
    }

    let download = config.partition(&config.roles.download)?;
    if HEADER_SIZE + body.len() > download.len as usize {
        return Err(anyhow::anyhow!(
            "Package of {} bytes does not fit {} of {}",
            HEADER_SIZE + body.len(),
            download.name,
            format_size(download.len)
        ));
    }

    let timestamp = match args.timestamp {
        Some(timestamp) => timestamp,
        None => SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as u32,
    };

    let package = processor::package(&body, &target, &args.firmware_version, timestamp)?;
    let output_path = args.output_path_with_default();
    write_file(&output_path, &package)?;

    log::info!(
        "Packaged {} byte image for {target} version {} into {}",
        body.len(),
        args.firmware_version,
        output_path.display()
    );
    Ok(())
}

pub fn inspect(input_path: &Path) -> anyhow::Result<()> {
    let inspection = processor::inspect(&read_file(input_path)?)?;
    let header = &inspection.header;

    println!("Target:    {}", header.target);
    println!("Version:   {}", header.version_str());
    println!("Timestamp: {}", header.timestamp);
    println!("Body:      {} bytes, digest {}", header.body_len, header.body_digest);

    match inspection.computed {
        Some(_) if inspection.is_intact() => {
            println!("Body intact");
            Ok(())
        }
        Some(computed) => Err(anyhow::anyhow!(
            "Body digest {computed} does not match declared {}",
            header.body_digest
        )),
        None => Err(anyhow::anyhow!(
            "Package holds {} of {} body bytes",
            inspection.available,
            header.body_len
        )),
    }
}

pub fn shadow(input_path: &Path, output_path: Option<PathBuf>) -> anyhow::Result<()> {
    let bootloader = objcopy::flatten(&read_file(input_path)?)?;
    let output_path = output_path.unwrap_or_else(|| input_path.with_extension("shadow.bin"));

    write_file(&output_path, &processor::shadow(&bootloader))?;
    log::info!("Wrote shadow of {} byte bootloader to {}", bootloader.len(), output_path.display());
    Ok(())
}
