use std::path::Path;
use std::sync::OnceLock;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::LogConfig;

pub const AUDIT_TARGET: &str = "mls_listings::audit";
pub const CHANGEFEED_TARGET: &str = "mls_listings::changefeed";

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_SIZE: u64 = 10 * 1024 * 1024;

static HANDLE: OnceLock<log4rs::Handle> = OnceLock::new();

#[must_use]
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn rolling(dir: &Path, name: &str, keep: u32) -> Result<RollingFileAppender, Box<dyn std::error::Error>> {
    let roller = FixedWindowRoller::builder().build(&format!("{}", dir.join(format!("{name}.{{}}.log")).display()), keep)?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE)), Box::new(roller));
    Ok(RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(dir.join(format!("{name}.log")), Box::new(policy))?)
}

/// Builds the log4rs configuration: console always, plus `app.log` and a
/// separate `audit.log` when a directory is configured.
///
/// # Errors
/// Returns an error if the log directory cannot be created or an appender fails to build.
pub fn build_config(cfg: &LogConfig) -> Result<Config, Box<dyn std::error::Error>> {
    let level = parse_level(&cfg.level);
    let console = ConsoleAppender::builder().encoder(Box::new(PatternEncoder::new(PATTERN))).build();
    let mut builder = Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");
    let mut audit = Logger::builder().appender("console");

    if let Some(dir) = &cfg.dir {
        std::fs::create_dir_all(dir)?;
        let keep = cfg.retention.max(1);
        builder = builder
            .appender(Appender::builder().build("app", Box::new(rolling(dir, "app", keep)?)))
            .appender(Appender::builder().build("audit", Box::new(rolling(dir, "audit", keep)?)));
        root = root.appender("app");
        audit = audit.appender("audit");
    }

    Ok(builder
        .logger(audit.additive(false).build(AUDIT_TARGET, LevelFilter::Info.max(level)))
        .logger(Logger::builder().build(CHANGEFEED_TARGET, level))
        .build(root.build(level))?)
}

/// Initialises process-wide logging once; later calls are no-ops.
///
/// # Errors
/// Returns an error if the configuration cannot be built or another logger
/// is already installed.
pub fn init(cfg: &LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    if HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = log4rs::init_config(build_config(cfg)?)?;
    let _ = HANDLE.set(handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::Debug);
        assert_eq!(parse_level("bogus"), LevelFilter::Info);
    }

    #[test]
    fn file_appenders_created_in_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = LogConfig { dir: Some(tmp.path().join("logs")), ..LogConfig::default() };
        assert!(build_config(&cfg).is_ok());
        assert!(tmp.path().join("logs").is_dir());
    }
}
