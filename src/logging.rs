//! Logger set-up: `env_logger` with local timestamps, `info` unless `RUST_LOG` says otherwise.

use std::io::Write;

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;

pub fn init() {
    init_with_level(LevelFilter::Info);
}

pub fn init_with_level(level: LevelFilter) {
    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

    // a second init (tests, embedding apps) keeps the first logger
    if builder.try_init().is_ok() {
        log::info!("Logging initialized");
    }
}
