//! Interactive client for a linevault server
//!
//! Sends each entered line as a raw protocol command and prints whatever the
//! server answers.

use clap::Parser;
use linevault::Client;
use std::io::{self, Write};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive linevault client")]
struct Args {
    /// Server hostname
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 9999)]
    port: u16,

    /// How long to wait for further response lines, in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let server_addr = format!("{}:{}", args.host, args.port);

    println!("Connecting to linevault server at {}...", server_addr);
    let mut client = Client::connect(server_addr.as_str())
        .await?
        .with_response_timeout(Duration::from_millis(args.timeout_ms));
    println!("Connected! Type 'help' for the command format or 'exit' to quit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        match input {
            "" => continue,
            "exit" | "quit" => break,
            "help" => print_help(),
            command => {
                if let Err(e) = run_command(&mut client, command).await {
                    println!("Error: {}", e);
                    break;
                }
            }
        }
    }

    client.close().await?;
    println!("Goodbye!");
    Ok(())
}

async fn run_command(client: &mut Client, command: &str) -> linevault::Result<()> {
    client.send_line(command.as_bytes()).await?;

    let responses = client.read_responses().await?;
    for response in &responses {
        println!("Response: {}", String::from_utf8_lossy(response));
    }
    if responses.is_empty() && command.starts_with("Get:") {
        println!("No values found for this key");
    }
    Ok(())
}

fn print_help() {
    println!("Command format examples:");
    println!("  Put:mykey:myvalue");
    println!("  Get:mykey");
    println!("  Update:mykey:oldvalue:newvalue");
    println!("  Delete:mykey");
    println!("  exit - Exit the client");
}
