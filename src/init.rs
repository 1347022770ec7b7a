use log::LevelFilter;

/// Wire up logging for binaries and test harnesses. Call once per process.
pub fn setup_logging(verbosity: u64, file_name: Option<&str>) {
    let base_config = match verbosity {
        0 => fern::Dispatch::new().level(LevelFilter::Warn),
        1 => fern::Dispatch::new().level(LevelFilter::Info),
        2 => fern::Dispatch::new().level(LevelFilter::Debug),
        _ => fern::Dispatch::new().level(LevelFilter::Trace),
    };

    let mut config = fern::Dispatch::new().format(|out, message, record| {
        let target = record.target();
        let stripped_target = target.strip_prefix("zettaslab::").unwrap_or(target);
        out.finish(format_args!(
            "[{}][{}][{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            stripped_target,
            record.level(),
            message
        ))
    });
    config = match file_name {
        None => config.chain(std::io::stdout()),
        Some(file_name) => config.chain(fern::log_file(file_name).unwrap()),
    };

    base_config.chain(config).apply().unwrap();
}
