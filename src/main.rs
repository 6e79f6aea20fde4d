use log::{error, info};
use signal_hook::iterator::Signals;

fn main() {
    if let Err(err) = kosd::logging::setup_logging(kosd::logging::level_from_env()) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    let config = kosd::KosConfig::from_env();
    let runtime = match kosd::RuntimeInfo::init(config) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to initialize runtime: {err}");
            std::process::exit(1);
        }
    };
    let syscalls = runtime.syscalls();
    info!("kosd is up with {} syscalls registered", syscalls.ids().len());

    let mut signals = match Signals::new([signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT])
    {
        Ok(signals) => signals,
        Err(err) => {
            error!("failed to install signal handlers: {err}");
            std::process::exit(1);
        }
    };
    for signal in signals.forever() {
        info!("received host signal {signal}, shutting down");
        break;
    }

    runtime.shutdown();
}
