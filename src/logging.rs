use env_logger;
use log::debug;

/// Initialize the logger with the specified verbosity level
///
/// # Arguments
/// * `verbose` - Verbosity level (0=warn, 1=info, 2=debug, 3+=trace)
pub fn setup_logger(verbose: u8) {
    let env_filter = default_filter(verbose);

    if let Err(err) =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(env_filter))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init()
    {
        debug!("Logger already initialized: {err}");
    }
}

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "worklease=warn",
        1 => "worklease=info",
        2 => "worklease=debug",
        _ => "worklease=trace",
    }
}
