//! CLI entry point for fetchbatch.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fetchbatch_core::assembler::{self, DirectorySink, OutputMode, WriterSink};
use fetchbatch_core::download::{
    BatchDownloader, BatchError, ClientProvider, DEFAULT_CONCURRENCY, DEFAULT_REQUEST_TIMEOUT,
    DownloadRequest, DownloadResult,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod app_config;
mod cli;

use app_config::{FileConfig, load_default_file_config};
use cli::Args;

/// Process outcome mapped to an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    Success,
    Failure,
    Interrupted,
}

impl ProcessExit {
    fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Interrupted => 130,
        }
    }
}

impl From<ProcessExit> for ExitCode {
    fn from(outcome: ProcessExit) -> Self {
        ExitCode::from(outcome.code())
    }
}

/// One saved file in the `--json` summary.
#[derive(Debug, Serialize)]
struct SavedFile<'a> {
    index: usize,
    url: &'a str,
    path: PathBuf,
    mime_type: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let loaded = load_default_file_config()?;
    let config = loaded.config;

    init_tracing(default_log_level(&args, &config));
    debug!(?args, config_path = ?loaded.path, "CLI arguments parsed");

    let input_text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/file.pdf' | fetchbatch");
        return Ok(ProcessExit::Success.into());
    };

    let urls = collect_urls(&input_text);
    if urls.is_empty() {
        info!("No URLs found in input");
        return Ok(ProcessExit::Success.into());
    }

    let outcome = run(&args, &config, &urls).await?;
    Ok(outcome.into())
}

fn default_log_level(args: &Args, config: &FileConfig) -> &'static str {
    // Priority: RUST_LOG env var > quiet flag > verbose flag > config file > info
    if args.quiet {
        return "error";
    }
    match args.verbose {
        0 => config.verbosity.map_or("info", |v| v.default_level()),
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .try_init();
}

/// One URL per line; blank lines and `#` comments are skipped.
fn collect_urls(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn build_requests(args: &Args, config: &FileConfig, urls: &[String]) -> Result<Vec<DownloadRequest>> {
    if args.name.is_some() && urls.len() != 1 {
        bail!("--name requires exactly one URL, got {}", urls.len());
    }

    let timeout = match (args.timeout, config.timeout_secs) {
        (Some(secs), _) => Duration::from_secs_f64(secs),
        (None, Some(secs)) => Duration::from_secs(secs),
        (None, None) => DEFAULT_REQUEST_TIMEOUT,
    };
    let proxy = args.proxy.as_ref().or(config.proxy.as_ref());
    let verify_tls = !args.insecure && config.verify_tls.unwrap_or(true);

    urls.iter()
        .enumerate()
        .map(|(index, url)| {
            let mut request = DownloadRequest::new(index, url.as_str())
                .with_method(args.method.clone())
                .with_timeout(timeout)
                .with_verify_tls(verify_tls);
            for (name, value) in &args.headers {
                request = request
                    .with_header(name, value)
                    .with_context(|| format!("invalid header '{name}'"))?;
            }
            if let Some(data) = &args.data {
                request = request.with_body(data.as_bytes());
            }
            if let Some(proxy) = proxy {
                request = request.with_proxy(proxy.as_str());
            }
            if let Some(name) = &args.name {
                request = request.with_file_name(name.as_str());
            }
            Ok(request)
        })
        .collect()
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory '{}'", path.display()))
}

async fn run(args: &Args, config: &FileConfig, urls: &[String]) -> Result<ProcessExit> {
    let requests = build_requests(args, config, urls)?;

    let concurrency = args
        .concurrency
        .map(usize::from)
        .or(config.concurrency)
        .unwrap_or(DEFAULT_CONCURRENCY);
    let provider = Arc::new(ClientProvider::new());
    let mut downloader = BatchDownloader::new(Arc::clone(&provider), concurrency)
        .context("invalid batch configuration")?;
    if let Some(temp_dir) = args.temp_dir.as_ref().or(config.temp_dir.as_ref()) {
        ensure_dir(temp_dir)?;
        downloader = downloader.with_temp_dir(temp_dir);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling batch");
            signal_cancel.cancel();
        }
    });

    info!(urls = urls.len(), concurrency, "Starting downloads");
    let batch = downloader.run_batch_with_cancel(requests, cancel).await;
    signal_task.abort();

    let outcome = match batch {
        Ok(results) => emit(args, config, urls, results).await.map(|()| ProcessExit::Success),
        Err(BatchError::Cancelled) => {
            warn!("Batch cancelled; no files were kept");
            Ok(ProcessExit::Interrupted)
        }
        Err(e) => {
            error!(error = %e, index = ?e.index(), "Batch failed; no files were kept");
            Ok(ProcessExit::Failure)
        }
    };
    provider.shutdown();
    outcome
}

async fn emit(
    args: &Args,
    config: &FileConfig,
    urls: &[String],
    results: Vec<DownloadResult>,
) -> Result<()> {
    if args.text {
        let mut sink = WriterSink::new(io::stdout());
        let sent = assembler::assemble(results, OutputMode::Text, &mut sink).await?;
        debug!(messages = sent, "Printed text output");
        return Ok(());
    }

    let output_dir = args
        .output_dir
        .clone()
        .or_else(|| config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    ensure_dir(&output_dir)?;

    let summary: Vec<(usize, Option<String>)> = results
        .iter()
        .map(|result| (result.index, result.mime_type.clone()))
        .collect();
    let mut sink = DirectorySink::new(&output_dir);
    let saved = assembler::assemble(results, OutputMode::File, &mut sink).await?;
    info!(saved, output_dir = %output_dir.display(), "Download complete");

    if args.json {
        let files: Vec<SavedFile<'_>> = summary
            .into_iter()
            .zip(sink.written())
            .map(|((index, mime_type), path)| SavedFile {
                index,
                url: urls.get(index).map_or("", String::as_str),
                path: path.clone(),
                mime_type,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&files)?);
    } else {
        for path in sink.written() {
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("fetchbatch").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_collect_urls_skips_blank_and_comment_lines() {
        let urls = collect_urls("https://a.test/1\n\n  # comment\n  https://b.test/2  \n");
        assert_eq!(urls, vec!["https://a.test/1", "https://b.test/2"]);
    }

    #[test]
    fn test_build_requests_assigns_indices_and_options() {
        let args = args(&["-X", "POST", "-H", "X-Key: 1", "--data", "body", "--timeout", "2"]);
        let urls = vec!["https://a.test/1".to_string(), "https://b.test/2".to_string()];

        let requests = build_requests(&args, &FileConfig::default(), &urls).unwrap();

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].index, 1);
        assert_eq!(requests[1].url, "https://b.test/2");
        assert_eq!(requests[0].method, reqwest::Method::POST);
        assert_eq!(requests[0].headers.get("x-key").unwrap(), "1");
        assert_eq!(requests[0].body.as_deref(), Some(&b"body"[..]));
        assert_eq!(requests[0].timeout, Duration::from_secs(2));
        assert!(requests[0].verify_tls);
    }

    #[test]
    fn test_build_requests_cli_overrides_config() {
        let config = FileConfig {
            timeout_secs: Some(30),
            verify_tls: Some(true),
            proxy: Some("http://config-proxy:3128".to_string()),
            ..FileConfig::default()
        };
        let args = args(&["--insecure", "--proxy", "http://cli-proxy:8080"]);

        let requests = build_requests(&args, &config, &["https://a.test".to_string()]).unwrap();

        assert_eq!(requests[0].timeout, Duration::from_secs(30));
        assert!(!requests[0].verify_tls);
        assert_eq!(requests[0].proxy_url.as_deref(), Some("http://cli-proxy:8080"));
    }

    #[test]
    fn test_build_requests_defaults_timeout() {
        let requests =
            build_requests(&args(&[]), &FileConfig::default(), &["https://a.test".to_string()])
                .unwrap();
        assert_eq!(requests[0].timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(requests[0].proxy_url.is_none());
    }

    #[test]
    fn test_build_requests_name_needs_single_url() {
        let urls = vec!["https://a.test/1".to_string(), "https://b.test/2".to_string()];
        let err = build_requests(&args(&["--name", "out.bin"]), &FileConfig::default(), &urls)
            .unwrap_err();
        assert!(err.to_string().contains("--name"));

        let requests = build_requests(
            &args(&["--name", "out.bin"]),
            &FileConfig::default(),
            &urls[..1],
        )
        .unwrap();
        assert_eq!(requests[0].custom_file_name.as_deref(), Some("out.bin"));
    }

    #[test]
    fn test_default_log_level_priority() {
        let config = FileConfig {
            verbosity: Some(app_config::VerbositySetting::Quiet),
            ..FileConfig::default()
        };
        assert_eq!(default_log_level(&args(&[]), &config), "error");
        assert_eq!(default_log_level(&args(&["-v"]), &config), "debug");
        assert_eq!(default_log_level(&args(&["-q", "-vv"]), &FileConfig::default()), "error");
        assert_eq!(default_log_level(&args(&[]), &FileConfig::default()), "info");
    }

    #[test]
    fn test_process_exit_codes() {
        assert_eq!(ProcessExit::Success.code(), 0);
        assert_eq!(ProcessExit::Failure.code(), 1);
        assert_eq!(ProcessExit::Interrupted.code(), 130);
    }
}
