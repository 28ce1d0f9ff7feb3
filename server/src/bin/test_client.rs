//! Interactive test client.
//!
//! Connects to a running server, forwards stdin lines as raw protocol lines
//! and prints every decoded packet the server sends back. PING packets are
//! answered automatically so the connection looks alive to the server.
//!
//! Example session:
//!
//! ```text
//! LOGIN alice
//! CRLBY den
//! CHATC hello there
//! DISCN
//! ```

use clap::Parser;
use shared::{DecodeError, Packet};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address to connect to
    #[clap(short, long, default_value = "127.0.0.1:11337")]
    address: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let stream = TcpStream::connect(&args.address).await?;
    println!("Connected to {}", args.address);
    let (read_half, mut write_half) = stream.into_split();

    let mut server_lines = BufReader::new(read_half).lines();
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = server_lines.next_line() => {
                let Some(line) = line? else {
                    println!("Server closed the connection");
                    break;
                };
                match Packet::decode(&line) {
                    Ok(Packet::Ping { timestamp }) => {
                        let pong = Packet::Pong { timestamp };
                        write_half.write_all(pong.encode().as_bytes()).await?;
                        write_half.write_all(b"\n").await?;
                    }
                    Ok(packet) => println!("<- {:?}", packet),
                    Err(DecodeError::Invalid { kind, errors }) => {
                        println!("<- invalid {:?}: {}", kind, errors.join(" "));
                    }
                    Err(e) => println!("<- undecodable line `{}`: {}", line, e),
                }
            }
            line = stdin_lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.is_empty() {
                    continue;
                }
                write_half.write_all(line.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
                if line.trim_end() == "DISCN" {
                    break;
                }
            }
        }
    }

    Ok(())
}
