use anyhow::Result;
use std::fs;
use std::path::Path;

const LOG_PREFIX: &str = "pressure_monitor_";

// Modules that log once per reading. They stay at info unless trace is asked for.
const PER_READING_TARGETS: [&str; 2] = ["lib_pressure::core::registry", "lib_pressure::core::sampler"];

// Stdout carries the JSON record stream, so console logging goes to stderr.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<()> {
    fs::create_dir_all(log_dir)?;
    cleanup_old_logs(log_dir)?;

    let log_path = log_dir.join(format!(
        "{}{}.log",
        LOG_PREFIX,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    ));
    let level = parse_level(log_level);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);
    if level < log::LevelFilter::Trace {
        for target in PER_READING_TARGETS {
            dispatch = dispatch.level_for(target, level.min(log::LevelFilter::Info));
        }
    }
    dispatch
        .chain(std::io::stderr())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

pub fn parse_level(log_level: &str) -> log::LevelFilter {
    log_level.parse().unwrap_or(log::LevelFilter::Info)
}

/// Deletes every monitor log in `log_dir` except the newest. Other files in a
/// shared log directory are left alone.
pub fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut logs: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(".log")
        })
        .filter_map(|e| Some((e.metadata().and_then(|m| m.modified()).ok()?, e.path())))
        .collect();

    logs.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));
    for (_, path) in logs.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}
