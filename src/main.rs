use std::process::ExitCode;
use std::sync::Arc;

use tunnelmux::authenticator::{Authenticator, LocalAuthenticator, NoneAuthenticator};
use tunnelmux::client;
use tunnelmux::config::{ClientConfig, ServerConfig};
use tunnelmux::server::Server;

struct Args {
    role: String,
    config: String,
}

fn parse_args() -> Result<Args, String> {
    let mut argv = std::env::args().skip(1);
    let role = argv
        .next()
        .ok_or_else(|| "usage: tunnelmux <client|server> [--config <path>]".to_string())?;

    let mut config = match role.as_str() {
        "client" => "client.toml".to_string(),
        "server" => "config.toml".to_string(),
        other => return Err(format!("unknown role \"{}\", expected client or server", other)),
    };

    while let Some(flag) = argv.next() {
        match flag.as_str() {
            "--config" => {
                config = argv
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
            }
            other => return Err(format!("unrecognized flag \"{}\"", other)),
        }
    }

    Ok(Args { role, config })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.role.as_str() {
        "client" => runtime.block_on(run_client(&args.config)),
        "server" => runtime.block_on(run_server(&args.config)),
        _ => unreachable!("validated in parse_args"),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run_client(path: &str) -> Result<(), tunnelmux::Error> {
    let config = Arc::new(ClientConfig::load(path)?);
    log::info!("loaded client config from {}", path);

    tokio::select! {
        result = client::run_all(config) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal");
            Ok(())
        }
    }
}

async fn run_server(path: &str) -> Result<(), tunnelmux::Error> {
    let config = ServerConfig::load(path)?;
    log::info!("loaded server config from {}", path);

    let authenticator: Arc<dyn Authenticator> = match config.auth_type.as_str() {
        "local" => Arc::new(LocalAuthenticator::from_config(&config)),
        _ => Arc::new(NoneAuthenticator),
    };

    let server = Arc::new(Server::bind(&config, authenticator).await?);
    log::info!("listening on {}", config.listen);

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal");
        }
    }
    Ok(())
}
