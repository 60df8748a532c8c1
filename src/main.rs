use log::{error, info};
use std::io::Write;
use std::process::ExitCode;
use wmbusrx::{drivers, radio::HexStreamRadio, Config, LinkMode, Receiver, Registry};

fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("WMBUSRX_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config_path = std::env::args().nth(1).unwrap_or("wmbusrx.yml".to_string());
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut registry = Registry::new();
    if let Err(e) = drivers::register_all(&mut registry) {
        error!("driver registration failed: {}", e);
        return ExitCode::FAILURE;
    }
    info!("{} drivers registered", registry.all().len());

    let mut receiver = Receiver::new(
        registry,
        config.receiver.afl_max_sessions,
        config.receiver.afl_timeout_secs,
    );
    for mc in &config.meters {
        if let Err(e) = receiver.add_meter(mc.to_meter_info()) {
            /* Configuration errors are the only fatal ones. */
            error!("meter \"{}\": {}", mc.name, e);
            return ExitCode::FAILURE;
        }
    }

    /* Frames arrive as hex lines on stdin, one telegram per line. The
    radio transceiver build replaces this source with its driver. */
    let link_mode = config
        .receiver
        .link_modes
        .first()
        .copied()
        .unwrap_or(LinkMode::T1);
    let stdin = std::io::stdin().lock();
    let mut radio = HexStreamRadio::new(stdin, link_mode);

    let stdout = std::io::stdout();
    receiver.run(&mut radio, &mut |record| {
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{}", record);
    });

    info!(
        "done: {} frames, {} telegrams, {} crc errors",
        receiver.counters.frames_ok,
        receiver.counters.telegrams_decoded,
        receiver.counters.crc_errors
    );
    ExitCode::SUCCESS
}
