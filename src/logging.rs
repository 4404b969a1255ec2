use std::io::Write;

use env_logger::Builder;

/// Build the logger from the default env ("RUST_LOG"). Call once per
/// process; tests route it through a `std::sync::Once`.
pub fn init_log() {
    let mut builder = Builder::from_default_env();

    builder
        .format_timestamp_secs()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();
}
