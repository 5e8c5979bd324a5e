use env_logger::Builder;

/// Convenience function for setting up `env_logger` to see log messages.
pub fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder.format_timestamp_millis().try_init().ok();
}
