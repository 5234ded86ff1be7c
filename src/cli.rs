//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use reqwest::Method;

/// Download a batch of URLs concurrently, all or nothing.
///
/// Every URL is fetched into a temporary file. If any download fails, the
/// whole batch fails and no partial files are left behind.
#[derive(Parser, Debug)]
#[command(name = "fetchbatch")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download (read from stdin when omitted)
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum concurrent downloads (1-200)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u16).range(1..=200))]
    pub concurrency: Option<u16>,

    /// HTTP method for every request
    #[arg(short = 'X', long, default_value = "GET", value_parser = parse_method)]
    pub method: Method,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Request body sent with every request
    #[arg(long)]
    pub data: Option<String>,

    /// Seconds to wait for the response and for each piece of the body
    #[arg(long, value_parser = parse_timeout_secs)]
    pub timeout: Option<f64>,

    /// Proxy URL for every request
    #[arg(long)]
    pub proxy: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// File name for the download (single URL only)
    #[arg(long)]
    pub name: Option<String>,

    /// Decode downloads as text and print them to stdout
    #[arg(long, conflicts_with = "output_dir")]
    pub text: bool,

    /// Directory for finished files (default: current directory)
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Directory for temporary download files
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Print a JSON summary of saved files to stdout
    #[arg(long, conflicts_with = "text")]
    pub json: bool,
}

fn parse_method(value: &str) -> Result<Method, String> {
    Method::from_bytes(value.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method '{value}'"))
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    let Some((name, header_value)) = value.split_once(':') else {
        return Err(format!("expected \"Name: value\", got '{value}'"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing header name in '{value}'"));
    }
    Ok((name.to_string(), header_value.trim().to_string()))
}

fn parse_timeout_secs(value: &str) -> Result<f64, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid number '{value}'"))?;
    if secs.is_finite() && secs > 0.0 && secs <= 3600.0 {
        Ok(secs)
    } else {
        Err(format!("timeout must be in (0, 3600] seconds, got {value}"))
    }
}
