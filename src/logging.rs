//! Logger initialisation for drivers.
//!
//! The library itself only uses the `log` macros. A driver installs a backend once,
//! usually after the transport is up so every line can carry the rank.

use std::io::Write;

use env_logger::{Builder, Target};
use log::LevelFilter;

fn level_filter(level: Option<&str>) -> LevelFilter {
    level
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .or_else(|| {
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|v| v.parse::<LevelFilter>().ok())
        })
        .unwrap_or(LevelFilter::Info)
}

/// Initialise logging to stderr.
///
/// `level` is a level name such as "debug". Without it `RUST_LOG` is used, then `info`.
/// Repeated calls keep the first logger.
pub fn init_logging(level: Option<&str>) {
    let _ = Builder::new()
        .filter_level(level_filter(level))
        .target(Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {:5} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

/// Initialise logging with every line prefixed by `rank`.
pub fn init_logging_for_rank(rank: usize, level: Option<&str>) {
    let _ = Builder::new()
        .filter_level(level_filter(level))
        .target(Target::Stderr)
        .format(move |buf, record| {
            writeln!(
                buf,
                "[rank {:>3} {} {:5} {}] {}",
                rank,
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

#[cfg(test)]
mod test {
    use log::LevelFilter;

    use super::level_filter;

    #[test]
    fn test_explicit_level_wins() {
        assert_eq!(level_filter(Some("debug")), LevelFilter::Debug);
        assert_eq!(level_filter(Some("TRACE")), LevelFilter::Trace);
    }
}
