use apcupsd_mqtt::configuration::Configuration;
use apcupsd_mqtt::{ApcupsdClient, Catalog, ConfigError, Daemon, MqttPublisher};
use log::{debug, error, info};
use std::path::Path;
use std::process::ExitCode;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "/etc/apcupsd-mqtt.conf";

/// Loads the configuration file given on the command line, the default one, or the built-in one
fn load_configuration() -> Result<Configuration, ConfigError> {
    let args: Vec<String> = std::env::args().collect();

    let mut config = match args.get(1) {
        Some(path) => Configuration::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Configuration::load(DEFAULT_CONFIG_PATH)?
        }
        None => Configuration::builtin()?,
    };
    config.apply_environment()?;

    Ok(config)
}

/// Cancels `token` on Ctrl-C or SIGTERM
fn watch_signals(token: CancellationToken) -> std::io::Result<()> {
    let mut terminal_signal = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => debug!("Ctrl-C received"),
            _ = terminal_signal.recv() => debug!("Interrupt received"),
        }
        token.cancel();
    });

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_configuration() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = stderrlog::new()
        .module(module_path!())
        .verbosity(config.verbosity().saturating_sub(1))
        .init()
    {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let catalog = match Catalog::load(config.sensors.as_deref().map(Path::new)) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Failed to load the sensor catalog: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Reading apcupsd at {}:{}, publishing to {}:{}",
        config.apcupsd.host, config.apcupsd.port, config.mqtt.host, config.mqtt.port
    );

    let fetcher = ApcupsdClient::from_config(&config);
    let publisher = MqttPublisher::new(&config);
    let daemon = Daemon::new(config, catalog, fetcher, publisher);

    if let Err(e) = watch_signals(daemon.cancellation_token()) {
        error!("Failed to install the signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Invalid sensor configuration: {e}");
            ExitCode::FAILURE
        }
    }
}
