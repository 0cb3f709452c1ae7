use std::process::ExitCode;

use salon_relay::{RelayError, Server, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn usage(program: &str) -> ExitCode {
    eprintln!("usage: {program} <port>");
    eprintln!("  listens on <port> for chat and on the next three ports for");
    eprintln!("  uploads, downloads and the channel directory");
    ExitCode::from(2)
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "salon-relay".to_string());
    let (Some(port), None) = (args.next(), args.next()) else {
        return usage(&program);
    };
    let Ok(port) = port.parse::<u16>() else {
        eprintln!("{program}: '{port}' is not a port number");
        return usage(&program);
    };

    match run(port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(port: u16) -> Result<(), RelayError> {
    let config = ServerConfig::builder().port(port).build()?;
    let server = Server::bind(config).await?;

    let stop = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                stop.cancel();
            }
            Err(e) => error!(error = %e, "cannot listen for interrupts"),
        }
    });

    server.run().await
}
