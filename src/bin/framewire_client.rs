use std::{error::Error, path::PathBuf};

use clap::Parser;
use framewire::{
    ClientSocket, ClientTrust, Incoming, TlsContexts, TlsSettings, Transport, TransportConfig,
    types,
};

/// Demonstration payload, NUL terminated.
const MESSAGE: &[u8] = b"This is the string that was transmitted.\0";

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    address: String,
    /// Server port
    #[arg(long, default_value_t = 7777)]
    port: u16,
    /// Number of packets to send
    #[arg(short = 'n', long, default_value_t = 500)]
    count: usize,
    /// Connect over TLS
    #[arg(long)]
    tls: bool,
    /// Verify the server against this PEM CA file; without it any certificate is accepted
    #[arg(long, requires = "tls")]
    ca: Option<PathBuf>,
    /// Name to verify the server certificate against, defaults to --address
    #[arg(long, requires = "tls")]
    server_name: Option<String>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let transport = if cli.tls {
        let trust = match cli.ca {
            Some(path) => ClientTrust::CaFile(path),
            None => ClientTrust::Insecure,
        };
        let mut settings = TlsSettings::client(trust);
        settings.server_name = cli.server_name;
        Transport::Tls(TlsContexts::new(settings))
    } else {
        Transport::Plain
    };

    let client = ClientSocket::connect(&cli.address, cli.port, transport, TransportConfig::default())?;
    for _ in 0..cli.count {
        client.write(types::LOG_MESSAGE, MESSAGE)?;
    }
    // The server drops the connection once it reads the marker, after every
    // packet queued before it.
    client.write(types::DISCONNECTED, &[])?;

    while let Some(incoming) = client.new_packet() {
        match incoming {
            Incoming::Packet(pkt) => println!("{pkt}"),
            Incoming::Closed(_) => break,
        }
    }
    println!("Sent {} packets", cli.count);

    Ok(())
}
