use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use framewire::{
    Incoming, ServerIdentity, ServerSocket, TlsContexts, TlsSettings, Transport, TransportConfig,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    address: String,
    /// Port to listen on
    #[arg(long, default_value_t = 7777)]
    port: u16,
    /// PEM certificate chain; enables TLS
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key matching --cert
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
    /// Relay every packet to all other connections
    #[arg(long)]
    relay: bool,
    /// Log the live connection count every N seconds
    #[arg(long)]
    health: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let transport = match (cli.cert, cli.key) {
        (Some(certificate), Some(private_key)) => {
            Transport::Tls(TlsContexts::new(TlsSettings::server(ServerIdentity {
                certificate,
                private_key,
            })))
        }
        _ => Transport::Plain,
    };
    let config = TransportConfig {
        health_interval: cli.health.map(Duration::from_secs),
        ..Default::default()
    };

    let server = Arc::new(ServerSocket::new(&cli.address, cli.port, transport, config)?);
    {
        let server = Arc::clone(&server);
        ctrlc::set_handler(move || server.shutdown())?;
    }

    while let Some(incoming) = server.new_packet() {
        match incoming {
            Incoming::Packet(pkt) => {
                println!("{pkt}");
                if cli.relay && !server.write_all_except_origin(&pkt) {
                    eprintln!("relay of {pkt} was not queued everywhere");
                }
                server.delete_packet(pkt);
            }
            Incoming::Closed(id) => println!("Connection {id} closed"),
        }
    }

    Ok(())
}
