use log::LevelFilter;
use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the global logger. `RUST_LOG` overrides the default `info`
/// level; safe to call more than once.
pub fn init_log() {
  INIT.call_once(|| {
    let _ = env_logger::Builder::new()
      .filter_level(LevelFilter::Info)
      .parse_default_env()
      .format_timestamp(None)
      .is_test(cfg!(test))
      .try_init();
  });
}

/// Quiet runs only keep warnings and errors.
pub fn set_quiet(quiet: bool) {
  if quiet {
    log::set_max_level(LevelFilter::Warn);
  }
}
