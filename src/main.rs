use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use streamfs::cache::Cache;
use streamfs::config::Config;
use streamfs::notifier::ChunkCacheNotifier;
use streamfs::stream::MediaStream;
use streamfs::upstream::{HttpUpstream, HttpUpstreamConfig, StaticUrl};

/// Largest single read issued against the stream, like a filesystem read call
const READ_SIZE: u64 = 128 * 1024;

struct ReadArgs {
    url: String,
    name: Option<String>,
    offset: u64,
    length: Option<u64>,
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Use RUST_LOG env var if set, otherwise default to info level
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("streamfs");

    match args.get(1).map(String::as_str) {
        Some("read") => {
            let read_args = parse_read_args(program, &args[2..]);
            if let Err(e) = run_read(read_args).await {
                error!("{}", e);
                std::process::exit(1);
            }
        }
        Some("cache-stats") => {
            if let Err(e) = run_cache_stats().await {
                error!("{}", e);
                std::process::exit(1);
            }
        }
        _ => {
            print_usage(program);
            std::process::exit(1);
        }
    }
}

fn parse_read_args(program: &str, args: &[String]) -> ReadArgs {
    let mut url = None;
    let mut name = None;
    let mut offset = 0;
    let mut length = None;
    let mut output = None;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = match flag {
            "--name" | "--offset" | "--length" | "--output" => match args.get(i + 1) {
                Some(value) => value,
                None => {
                    error!("{} requires a value", flag);
                    print_usage(program);
                    std::process::exit(1);
                }
            },
            _ if url.is_none() && !flag.starts_with("--") => {
                url = Some(flag.to_string());
                i += 1;
                continue;
            }
            _ => {
                error!("Unknown argument: {}", flag);
                print_usage(program);
                std::process::exit(1);
            }
        };

        match flag {
            "--name" => name = Some(value.clone()),
            "--offset" => offset = parse_number(program, flag, value),
            "--length" => length = Some(parse_number(program, flag, value)),
            _ => output = Some(PathBuf::from(value)),
        }
        i += 2;
    }

    let Some(url) = url else {
        error!("read requires a URL");
        print_usage(program);
        std::process::exit(1);
    };

    ReadArgs {
        url,
        name,
        offset,
        length,
        output,
    }
}

fn parse_number(program: &str, flag: &str, value: &str) -> u64 {
    match value.parse() {
        Ok(n) => n,
        Err(_) => {
            error!("{} expects a number, got {}", flag, value);
            print_usage(program);
            std::process::exit(1);
        }
    }
}

async fn run_read(args: ReadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();

    let cache = Arc::new(Cache::open(config.cache.clone()).await?);
    let _maintenance = cache.spawn_maintenance();
    let notifier = Arc::new(ChunkCacheNotifier::with_capacity(
        cache.clone(),
        config.stream.notifier_capacity,
    ));

    let upstream = HttpUpstream::new(HttpUpstreamConfig {
        connect_timeout: config.stream.connect_timeout(),
        proxy_url: config.stream.proxy_url.clone(),
        ..HttpUpstreamConfig::default()
    })?;

    let file_size = upstream.probe_size(&args.url).await?;
    let name = args.name.unwrap_or_else(|| args.url.clone());
    info!("Reading {} ({} bytes)", name, file_size);

    if args.offset >= file_size {
        let message = format!(
            "offset {} is past end of file ({} bytes)",
            args.offset, file_size
        );
        return Err(message.into());
    }
    let end = args
        .length
        .map_or(file_size, |length| (args.offset + length).min(file_size));

    let stream = MediaStream::new(
        notifier,
        Arc::new(upstream),
        Arc::new(StaticUrl),
        config.stream.clone(),
        name,
        file_size,
        args.url,
    )?;

    let mut out: Box<dyn std::io::Write> = match &args.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::sink()),
    };

    let mut position = args.offset;
    let result = async {
        while position < end {
            let size = READ_SIZE.min(end - position);
            let data = stream.read(position, size).await?;
            out.write_all(&data)?;
            position += data.len() as u64;
        }
        out.flush()?;
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;

    stream.close().await;
    result?;

    let stats = stream.stats();
    info!(
        "Read {} bytes ({} downloaded, {} connections, {} cache hits)",
        stats.bytes_served, stats.bytes_downloaded, stats.connections_opened, stats.cache_hits
    );
    Ok(())
}

async fn run_cache_stats() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();
    let cache = Cache::open(config.cache).await?;
    let stats = cache.stats();

    println!("Cache directory: {}", cache.config().cache_dir.display());
    println!("Chunks: {}", stats.total_chunks);
    println!(
        "Size: {} / {} bytes",
        stats.total_size_bytes, stats.max_size_bytes
    );
    Ok(())
}

fn print_usage(program: &str) {
    eprintln!("Usage:");
    eprintln!(
        "  {} read <url> [--name <cache key>] [--offset <bytes>] [--length <bytes>] [--output <file>]",
        program
    );
    eprintln!("  {} cache-stats", program);
    eprintln!();
    eprintln!("Configuration is read from STREAMFS_* environment variables or a .env file.");
}
