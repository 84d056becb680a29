//! hostgate-ctl - Command-line client for the hostgate control interface
//!
//! Usage:
//!   hostgate-ctl add <hostname> <backend>   Register a host
//!   hostgate-ctl get <hostname>             Show one host
//!   hostgate-ctl list                       List all hosts
//!   hostgate-ctl delete <hostname>          Remove a host
//!   hostgate-ctl status                     Show the live server generation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostgate::registry::Host;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

/// Default control endpoint
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:1234";

#[derive(Debug, Parser)]
#[command(name = "hostgate-ctl", version, about = "Manage hostgate virtual hosts")]
struct Cli {
    /// Control endpoint URL
    #[arg(long, env = "HOSTGATE_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a host
    Add {
        hostname: String,
        /// Target URL, e.g. http://127.0.0.1:9000
        backend: String,
        #[arg(long = "type", default_value = "http")]
        host_type: String,
    },
    /// Show one host
    Get { hostname: String },
    /// List all hosts
    List,
    /// Remove a host
    Delete { hostname: String },
    /// Show the live server
    Status,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct HostList {
    hosts: Vec<Host>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::new();
    let base = cli.endpoint.trim_end_matches('/');

    match cli.command {
        Command::Add {
            hostname,
            backend,
            host_type,
        } => {
            let host = Host {
                hostname,
                backend,
                host_type: host_type.into(),
            };
            let response = client
                .post(format!("{}/hosts", base))
                .json(&host)
                .send()
                .await
                .context("failed to reach control endpoint")?;
            let host: Host = expect_json(response, StatusCode::CREATED).await?;
            println!("added {} -> {}", host.hostname, host.backend);
        }
        Command::Get { hostname } => {
            let response = client
                .get(format!("{}/hosts/{}", base, hostname))
                .send()
                .await
                .context("failed to reach control endpoint")?;
            let host: Host = expect_json(response, StatusCode::OK).await?;
            print_hosts(&[host]);
        }
        Command::List => {
            let response = client
                .get(format!("{}/hosts", base))
                .send()
                .await
                .context("failed to reach control endpoint")?;
            let list: HostList = expect_json(response, StatusCode::OK).await?;
            if list.hosts.is_empty() {
                println!("no hosts registered");
            } else {
                print_hosts(&list.hosts);
            }
        }
        Command::Delete { hostname } => {
            let response = client
                .delete(format!("{}/hosts/{}", base, hostname))
                .send()
                .await
                .context("failed to reach control endpoint")?;
            if response.status() != StatusCode::NO_CONTENT {
                return Err(api_error(response).await);
            }
            println!("deleted {}", hostname);
        }
        Command::Status => {
            let response = client
                .get(format!("{}/status", base))
                .send()
                .await
                .context("failed to reach control endpoint")?;
            let status: serde_json::Value = expect_json(response, StatusCode::OK).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn expect_json<T: serde::de::DeserializeOwned>(
    response: Response,
    expected: StatusCode,
) -> Result<T> {
    if response.status() != expected {
        return Err(api_error(response).await);
    }
    response.json().await.context("invalid response body")
}

async fn api_error(response: Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => anyhow::anyhow!("{} ({}): {}", body.error, status, body.message),
        Err(_) => anyhow::anyhow!("unexpected response: {}", status),
    }
}

fn print_hosts(hosts: &[Host]) {
    let width = hosts.iter().map(|h| h.hostname.len()).max().unwrap_or(0).max(8);
    println!("{:<width$}  {:<6}  BACKEND", "HOSTNAME", "TYPE", width = width);
    for host in hosts {
        println!(
            "{:<width$}  {:<6}  {}",
            host.hostname,
            host.host_type.to_string(),
            host.backend,
            width = width
        );
    }
}
