//! flashmc - command-line access to a memcached pool
//!
//! A thin wrapper over [`flashmc::Client`] for poking at servers by hand.

use std::process;
use std::time::Duration;

use anyhow::{bail, Context};
use flashmc::{Client, ClientConfig, Protocol};
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// What to do once connected
#[derive(Debug)]
enum Command {
    Get { keys: Vec<String> },
    Set { key: String, value: String, ttl: u32 },
    Delete { key: String },
    Incr { key: String, delta: u64 },
    Decr { key: String, delta: u64 },
    Stats { group: Option<String> },
    Version,
    Flush,
}

/// CLI configuration
struct Config {
    /// Comma separated servers; empty means `MEMCACHE_SERVERS` or localhost
    servers: Vec<String>,
    protocol: Protocol,
    namespace: Option<String>,
    timeout: Duration,
    command: Command,
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut servers = Vec::new();
        let mut protocol = Protocol::default();
        let mut namespace = None;
        let mut timeout = Duration::from_secs(1);
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--servers" | "-s" => {
                    let value = option_value(&args, i, "--servers");
                    servers.extend(value.split(',').map(|s| s.trim().to_string()));
                    i += 2;
                }
                "--protocol" | "-p" => {
                    protocol = option_value(&args, i, "--protocol").parse().unwrap_or_else(|e| {
                        eprintln!("Error: {}", e);
                        process::exit(1);
                    });
                    i += 2;
                }
                "--namespace" | "-n" => {
                    namespace = Some(option_value(&args, i, "--namespace").to_string());
                    i += 2;
                }
                "--timeout" | "-t" => {
                    let ms: u64 = option_value(&args, i, "--timeout").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid timeout");
                        process::exit(1);
                    });
                    timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--help" | "-h" => {
                    print_help();
                    process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flashmc version {}", flashmc::VERSION);
                    process::exit(0);
                }
                other if other.starts_with('-') => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    process::exit(1);
                }
                _ => {
                    rest.push(args[i].clone());
                    i += 1;
                }
            }
        }

        let command = parse_command(&rest).unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            print_help();
            process::exit(1);
        });

        Config {
            servers,
            protocol,
            namespace,
            timeout,
            command,
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            servers: self.servers.clone(),
            protocol: self.protocol,
            namespace: self.namespace.clone(),
            socket_timeout: self.timeout,
            connect_timeout: self.timeout,
            ..Default::default()
        }
    }
}

fn option_value<'a>(args: &'a [String], i: usize, name: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", name);
            process::exit(1);
        }
    }
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    let Some((name, args)) = args.split_first() else {
        bail!("missing command");
    };

    let command = match (name.as_str(), args) {
        ("get", keys) if !keys.is_empty() => Command::Get {
            keys: keys.to_vec(),
        },
        ("set", [key, value]) => Command::Set {
            key: key.clone(),
            value: value.clone(),
            ttl: 0,
        },
        ("set", [key, value, ttl]) => Command::Set {
            key: key.clone(),
            value: value.clone(),
            ttl: ttl.parse().context("invalid ttl")?,
        },
        ("delete", [key]) => Command::Delete { key: key.clone() },
        ("incr", [key]) => Command::Incr {
            key: key.clone(),
            delta: 1,
        },
        ("incr", [key, delta]) => Command::Incr {
            key: key.clone(),
            delta: delta.parse().context("invalid delta")?,
        },
        ("decr", [key]) => Command::Decr {
            key: key.clone(),
            delta: 1,
        },
        ("decr", [key, delta]) => Command::Decr {
            key: key.clone(),
            delta: delta.parse().context("invalid delta")?,
        },
        ("stats", []) => Command::Stats { group: None },
        ("stats", [group]) => Command::Stats {
            group: Some(group.clone()),
        },
        ("version", []) => Command::Version,
        ("flush", []) => Command::Flush,
        (name, _) => bail!("bad arguments for command '{}'", name),
    };
    Ok(command)
}

fn print_help() {
    println!(
        r#"
flashmc - command-line memcached client

USAGE:
    flashmc [OPTIONS] <COMMAND> [ARGS...]

OPTIONS:
    -s, --servers <LIST>      Comma separated servers (default: $MEMCACHE_SERVERS
                              or 127.0.0.1:11211)
    -p, --protocol <NAME>     meta or binary (default: meta)
    -n, --namespace <NS>      Prefix keys with "<NS>:"
    -t, --timeout <MS>        Socket timeout in milliseconds (default: 1000)
    -v, --version             Print version information
    -h, --help                Print this help message

COMMANDS:
    get <KEY>...              Print the values of one or more keys
    set <KEY> <VALUE> [TTL]   Store a value
    delete <KEY>              Remove a key
    incr <KEY> [DELTA]        Increment a counter
    decr <KEY> [DELTA]        Decrement a counter
    stats [GROUP]             Print server statistics
    version                   Print server versions
    flush                     Invalidate every item on every server

EXAMPLES:
    flashmc set greeting hello 60
    flashmc --servers cache1:11211,cache2:11211 get a b c
    RUST_LOG=flashmc=debug flashmc --protocol binary stats
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging; stdout is for results
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let client = Client::new(config.client_config())?;
    debug!(servers = ?client.servers(), protocol = %client.protocol(), "Client ready");

    run(&client, config.command).await
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { keys } if keys.len() == 1 => match client.get(&keys[0]).await? {
            Some(item) => println!("{}", String::from_utf8_lossy(&item.value)),
            None => {
                eprintln!("(miss)");
                process::exit(2);
            }
        },
        Command::Get { keys } => {
            let found = client.get_multi(&keys).await?;
            for key in &keys {
                match found.get(key.as_bytes()) {
                    Some(item) => println!("{}: {}", key, String::from_utf8_lossy(&item.value)),
                    None => println!("{}: (miss)", key),
                }
            }
        }
        Command::Set { key, value, ttl } => {
            let cas = client.set(&key, &value, ttl).await?;
            println!("STORED (cas {})", cas);
        }
        Command::Delete { key } => {
            if client.delete(&key).await? {
                println!("DELETED");
            } else {
                println!("NOT_FOUND");
            }
        }
        Command::Incr { key, delta } => print_counter(client.incr(&key, delta, 0, None).await?),
        Command::Decr { key, delta } => print_counter(client.decr(&key, delta, 0, None).await?),
        Command::Stats { group } => {
            let mut all: Vec<_> = client.stats(group.as_deref()).await.into_iter().collect();
            all.sort_by(|a, b| a.0.cmp(&b.0));
            for (server, stats) in all {
                println!("{}", server);
                match stats {
                    Some(stats) => {
                        let mut stats: Vec<_> = stats.into_iter().collect();
                        stats.sort();
                        for (name, value) in stats {
                            println!("  {:<24} {}", name, value);
                        }
                    }
                    None => println!("  (unreachable)"),
                }
            }
        }
        Command::Version => {
            let mut all: Vec<_> = client.version().await.into_iter().collect();
            all.sort();
            for (server, version) in all {
                println!("{}: {}", server, version.as_deref().unwrap_or("(unreachable)"));
            }
        }
        Command::Flush => {
            client.flush(0).await?;
            println!("OK");
        }
    }

    client.close().await;
    Ok(())
}

fn print_counter(value: Option<u64>) {
    match value {
        Some(value) => println!("{}", value),
        None => println!("NOT_FOUND"),
    }
}
