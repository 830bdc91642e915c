use log::LevelFilter;

use std::{fs, io};

const LOG_FILE: &str = "seisflow-current.log";
const PREVIOUS_LOG_FILE: &str = "seisflow-previous.log";

pub fn setup(is_debug: bool) -> Result<(), fern::InitError> {
    let default_level = if is_debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let level = level_from(std::env::var("SEISFLOW_LOG").ok().as_deref()).unwrap_or(default_level);

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ));
        })
        .level(level)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("hyper_util", LevelFilter::Warn)
        .level_for("rustls", LevelFilter::Warn)
        .level_for("tokio_rustls", LevelFilter::Warn)
        .chain(io::stdout());

    match log_file() {
        Ok(file) => dispatch = dispatch.chain(file),
        Err(e) => eprintln!("Logging to stdout only: {e}"),
    }

    dispatch.apply()?;
    Ok(())
}

/// Opens a fresh log file, keeping the previous run's log next to it.
fn log_file() -> io::Result<fs::File> {
    let dir = data::ensure_data_folder().map_err(io::Error::other)?;

    let current = dir.join(LOG_FILE);
    if current.exists() {
        fs::rename(&current, dir.join(PREVIOUS_LOG_FILE))?;
    }

    fern::log_file(current)
}

fn level_from(value: Option<&str>) -> Option<LevelFilter> {
    value?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_override_parses_names() {
        assert_eq!(level_from(Some("trace")), Some(LevelFilter::Trace));
        assert_eq!(level_from(Some(" WARN ")), Some(LevelFilter::Warn));
        assert_eq!(level_from(Some("loud")), None);
        assert_eq!(level_from(None), None);
    }
}
