//! # framecast
//!
//! Shares rendered frames between processes.
//!
//! ## Mental model
//! - **Producer**: a render engine hands each finished frame (texture + command buffer) to the
//!   pipeline. `publish` never blocks on the GPU; the copy into a shared surface happens when the
//!   command buffer completes.
//! - **Surfaces**: a fixed rotation (default 3) of shared buffers. Memory is bounded no matter how
//!   slow a consumer is; when every surface is busy the frame is dropped, not queued.
//! - **Server**: announces the newest frame. Consumers pin a surface while they read it and
//!   release it afterwards. Consumers only ever see the newest frame.
//! - **Discovery**: a running server writes `<temp>/framecast/servers/<name>.json` so consumers
//!   can find its UDP endpoint by name.
//!
//! ## Commands
//! - `serve`: publish a moving test pattern from a software GPU
//! - `consume`: connect to a server and read frames
//! - `status`: query one or every advertised server
//! - `check`: validate `assets/share.json`
//!
//! ## Files that matter
//! - `assets/share.json` (or `assets/share.<os>.json`): server name, rotation depth, pixel format,
//!   backpressure policy, timeouts and the UDP bind address
//!
//! Everything in this crate is plumbing around `framecast-engine`: parse args, load config,
//! run one command.

mod cli;
mod demo;
mod validate;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use framecast_engine::assets::{read_to_string_result, AssetsRoot};
use framecast_engine::config::{load_share_config, LoadedShareConfig};
use framecast_engine::consumer::query_status;
use framecast_engine::server::discovery;
use framecast_engine::{loge, logi, logw};
use framecast_engine::{ConfigMode, RemoteConsumer, ShareConfig, ShareError};

use cli::{Cli, Command, ConsumeOpts};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match cli::parse(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("framecast: {e:#}\n\n{}", cli::USAGE);
            std::process::exit(2);
        }
    };

    if cli.command == Command::Help {
        println!("{}", cli::USAGE);
        return;
    }

    let run_id = framecast_engine::logging::init(cli.log_file.clone());
    logi!("INIT", "framecast {} run_id={run_id}", env!("CARGO_PKG_VERSION"));
    if let Some(p) = &cli.log_file {
        logi!("INIT", "log file: {}", p.display());
    }

    if let Err(e) = run(&cli) {
        loge!("INIT", "{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mode = if cli.strict { ConfigMode::Strict } else { ConfigMode::Lenient };
    match &cli.command {
        Command::Help => Ok(()),
        Command::Check => check(cli, mode),
        Command::Serve(opts) => {
            let loaded = load_config(cli, mode)?;
            demo::serve(loaded.config, opts)
        }
        Command::Consume(opts) => {
            let loaded = load_config(cli, mode)?;
            consume(&loaded.config, opts)
        }
        Command::Status { name } => {
            let loaded = load_config(cli, mode)?;
            status(&loaded.config, name.as_deref())
        }
    }
}

fn assets_root(cli: &Cli) -> Result<Option<AssetsRoot>> {
    if let Some(p) = &cli.assets {
        if !p.is_dir() {
            bail!("--assets {} is not a directory", p.display());
        }
        return Ok(Some(AssetsRoot::at(p)));
    }
    let cwd = std::env::current_dir().context("reading current directory")?;
    Ok(AssetsRoot::discover(&cwd).ok())
}

fn load_config(cli: &Cli, mode: ConfigMode) -> Result<LoadedShareConfig> {
    let Some(assets) = assets_root(cli)? else {
        logi!("CONFIG", "no assets directory found; using defaults");
        return Ok(LoadedShareConfig { path: None, config: ShareConfig::default() });
    };
    logi!("CONFIG", "assets: {}", assets.path().display());

    let loaded = load_share_config(&assets, mode)?;
    match &loaded.path {
        Some(p) => logi!("CONFIG", "share config: {}", p.display()),
        None => logi!("CONFIG", "no share.json in {}; using defaults", assets.path().display()),
    }

    let issues = validate::validate_share_config(&loaded.config);
    validate::emit_issues("CONFIG", &issues);
    if cli.strict && validate::has_errors(&issues) {
        bail!("share.json has errors (strict mode)");
    }
    Ok(loaded)
}

/// `check`: raw-document checks, parse, then semantic checks. Non-zero exit on any error.
fn check(cli: &Cli, mode: ConfigMode) -> Result<()> {
    let Some(assets) = assets_root(cli)? else {
        logw!("CONFIG", "no assets directory found; nothing to check");
        return Ok(());
    };
    let path = assets.pick_platform_json("share");
    if !path.exists() {
        logw!("CONFIG", "{} does not exist; defaults apply", path.display());
        return Ok(());
    }

    let src = read_to_string_result(&path)?;
    let raw: serde_json::Value =
        serde_json::from_str(&src).with_context(|| format!("parsing {}", path.display()))?;
    let mut issues = validate::validate_share_json(&raw);

    match ShareConfig::from_json_str(&src, mode, &path) {
        Ok(mut cfg) => {
            cfg.resolve_paths(assets.path());
            issues.extend(validate::validate_share_config(&cfg));
        }
        Err(e) => issues.push(validate::ValidationIssue::error(
            format!("{}", path.display()),
            e.to_string(),
            None,
        )),
    }

    validate::emit_issues("CONFIG", &issues);
    validate::emit_summary("CONFIG", "share.json", &issues);
    if validate::has_errors(&issues) {
        bail!("{} failed validation", path.display());
    }
    Ok(())
}

fn discovery_dir(cfg: &ShareConfig) -> PathBuf {
    cfg.discovery_dir.clone().unwrap_or_else(discovery::default_dir)
}

fn connect(cfg: &ShareConfig, opts: &ConsumeOpts) -> Result<RemoteConsumer> {
    if let Some(addr) = &opts.addr {
        return RemoteConsumer::connect(addr.as_str()).map_err(|e| anyhow!("connecting to {addr}: {e}"));
    }
    let name = opts.name.as_deref().unwrap_or(&cfg.server_name);
    let dir = discovery_dir(cfg);
    RemoteConsumer::discover(&dir, name).with_context(|| format!("finding server '{name}' in {}", dir.display()))
}

/// `consume`: read frames until the server stops or `--frames` is reached.
fn consume(cfg: &ShareConfig, opts: &ConsumeOpts) -> Result<()> {
    let mut consumer = connect(cfg, opts)?;
    // Servers usually share this config; ping well inside their session timeout.
    consumer.set_keepalive(Duration::from_millis(cfg.session_timeout_ms / 3).min(Duration::from_secs(1)));
    logi!("CONSUMER", "connected to {}", consumer.server_addr());

    let started = Instant::now();
    let mut received: u64 = 0;
    let mut skipped: u64 = 0;
    let mut prev: Option<u64> = None;

    loop {
        if opts.frames > 0 && received >= opts.frames {
            break;
        }
        let frame = match consumer.fetch(opts.timeout) {
            Ok(Some(f)) => f,
            Ok(None) => {
                // Timed out or the frame was revoked; make sure the server is still there.
                match consumer.ping() {
                    Ok(rtt) => {
                        logi!("CONSUMER", "no new frame within {:?} (rtt {rtt:?})", opts.timeout);
                        continue;
                    }
                    Err(e) => bail!("server not responding: {e}"),
                }
            }
            Err(ShareError::Stopped) => {
                logi!("CONSUMER", "server stopped");
                break;
            }
            Err(e) if e.is_fatal() => return Err(anyhow!("{e}")),
            Err(e) => {
                logw!("CONSUMER", "frame skipped: {e}");
                continue;
            }
        };

        if let Some(p) = prev {
            let gap = frame.seq.saturating_sub(p + 1);
            if gap > 0 {
                skipped += gap;
            }
        }
        prev = Some(frame.seq);
        received += 1;

        let center = frame.pixel(frame.width / 2, frame.height / 2).map(|px| px.to_vec()).unwrap_or_default();
        logi!(
            "CONSUMER",
            "frame seq={} {}x{} {} stride={} center={center:?}",
            frame.seq,
            frame.width,
            frame.height,
            frame.format.as_str(),
            frame.stride
        );
    }

    let secs = started.elapsed().as_secs_f64().max(0.001);
    logi!(
        "CONSUMER",
        "received {received} frame(s) in {secs:.1}s ({:.1}/s), {skipped} sequence number(s) skipped",
        received as f64 / secs
    );
    Ok(())
}

/// `status NAME` queries one server; plain `status` lists every advertised server.
fn status(cfg: &ShareConfig, name: Option<&str>) -> Result<()> {
    let dir = discovery_dir(cfg);
    let records = match name {
        Some(n) => vec![discovery::discover(&dir, n).with_context(|| format!("finding server '{n}'"))?],
        None => discovery::list(&dir),
    };
    if records.is_empty() {
        logi!("DISCOVERY", "no servers advertised in {}", dir.display());
        return Ok(());
    }

    for rec in records {
        match query_status(rec.addr.as_str(), Duration::from_secs(1)) {
            Ok(st) => logi!(
                "DISCOVERY",
                "{} @ {} pid={} format={} running={} seq={} sessions={} published={} dropped={}",
                rec.name,
                rec.addr,
                rec.pid,
                rec.format.as_str(),
                st.running,
                st.seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                st.sessions,
                st.published,
                st.dropped
            ),
            Err(e) => logw!("DISCOVERY", "{} @ {}: {e}", rec.name, rec.addr),
        }
    }
    Ok(())
}
