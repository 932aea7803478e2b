use clap::{Parser, Subcommand};
use log::warn;
use speedfish::reporter::{describe, EventReceiver, EventReporter, ProgressEvent};
use speedfish::{Client, Config, Server};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "speedfish")]
#[command(about = "Lightweight TCP speed test: latency, download and upload", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Address to listen on (":port" listens on every interface)
        #[arg(short, long, default_value = ":7121")]
        listen_addr: String,

        /// Canonical server name shown to clients
        #[arg(long)]
        cname: Option<String>,

        /// Server location shown to clients
        #[arg(long)]
        location: Option<String>,

        /// Log every copied block and echoed byte
        #[arg(short, long)]
        debug: bool,

        /// Download test length in seconds
        #[arg(short = 't', long, default_value = "10")]
        duration: u64,

        /// Interval between throughput samples in milliseconds
        #[arg(short = 'i', long, default_value = "1000")]
        report_interval_ms: u64,
    },

    /// Run in client mode
    Client {
        /// Server to test against, host[:port] (port defaults to 7121)
        server: String,

        /// Throughput test length in seconds
        #[arg(short = 't', long, default_value = "10")]
        duration: u64,

        /// Interval between throughput samples in milliseconds
        #[arg(short = 'i', long, default_value = "500")]
        report_interval_ms: u64,

        /// Number of echo round trips in the latency test
        #[arg(short = 'p', long, default_value = "30")]
        pings: usize,

        /// Print the final measurements as JSON
        #[arg(short = 'J', long)]
        json: bool,

        /// Verbose logging
        #[arg(short, long)]
        debug: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Server { debug, .. } | Commands::Client { debug, .. } => *debug,
    };
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Commands::Server {
            listen_addr,
            cname,
            location,
            debug,
            duration,
            report_interval_ms,
        } => {
            let mut config = Config::server(listen_addr)
                .with_debug(debug)
                .with_duration(Duration::from_secs(duration))
                .with_block_size(1024 * 1024)
                .with_report_interval(Duration::from_millis(report_interval_ms));
            if let Some(cname) = cname {
                config = config.with_cname(cname);
            }
            if let Some(location) = location {
                config = config.with_location(location);
            }

            let server = Server::new(config);
            let token = server.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
            server.run().await?;
        }

        Commands::Client {
            server,
            duration,
            report_interval_ms,
            pings,
            json,
            debug,
        } => {
            let config = Config::client(server)
                .with_debug(debug)
                .with_duration(Duration::from_secs(duration))
                .with_report_interval(Duration::from_millis(report_interval_ms))
                .with_ping_count(pings)
                .with_json(json);
            let event_queue = config.event_queue;

            let client = Client::new(config)?;
            let token = client.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping test");
                    token.cancel();
                }
            });

            let (reporter, events) = EventReporter::new(event_queue);
            let (result, ()) = tokio::join!(client.run_with_reporter(reporter), render(events, json));
            result?;

            let measurements = client.get_measurements();
            if json {
                println!("{}", serde_json::to_string_pretty(&measurements)?);
            } else {
                println!();
                print!("{}", measurements.summary());
            }
        }
    }

    Ok(())
}

/// Prints events line by line until the client drops its reporter.
async fn render(mut events: EventReceiver, quiet: bool) {
    while let Some(event) = events.recv().await {
        if quiet {
            continue;
        }
        match &event {
            ProgressEvent::Error(msg) => eprintln!("Error: {}", msg),
            _ => {
                if let Some(line) = describe(&event) {
                    println!("{}", line);
                }
            }
        }
    }
}
