//! Command-line parsing.
//!
//! Kept hand-rolled: a handful of flags, no nesting beyond one subcommand.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

pub const USAGE: &str = "\
usage: framecast [--log-file PATH] [--assets DIR] [--strict] <command> [options]

commands:
  serve    publish a moving test pattern from a software GPU
           [--frames N] [--seconds S] [--fps F] [--size WxH] [--flip] [--fail-every N]
  consume  read frames from a running server
           [--name NAME | --addr HOST:PORT] [--frames N] [--timeout-ms MS]
  status   query one server (NAME) or every advertised server
           [NAME]
  check    validate assets/share.json

environment:
  FRAMECAST_LOG_FILE   append log lines to this file (same as --log-file)
  FRAMECAST_ASSETS     assets directory (same as --assets)";

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub log_file: Option<PathBuf>,
    pub assets: Option<PathBuf>,
    pub strict: bool,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Serve(ServeOpts),
    Consume(ConsumeOpts),
    Status { name: Option<String> },
    Check,
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServeOpts {
    /// 0 = until `seconds` elapses (or forever).
    pub frames: u64,
    pub seconds: Option<f64>,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub flip: bool,
    /// Make every Nth command buffer fail (exercises the drop path).
    pub fail_every: Option<u64>,
}

impl Default for ServeOpts {
    fn default() -> Self {
        Self { frames: 0, seconds: None, fps: 60.0, width: 640, height: 360, flip: false, fail_every: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOpts {
    pub name: Option<String>,
    pub addr: Option<String>,
    /// 0 = until the server stops.
    pub frames: u64,
    pub timeout: Duration,
}

impl Default for ConsumeOpts {
    fn default() -> Self {
        Self { name: None, addr: None, frames: 0, timeout: Duration::from_secs(5) }
    }
}

fn value<'a>(it: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<&'a str> {
    it.next().map(|s| s.as_str()).ok_or_else(|| anyhow!("{flag} needs a value"))
}

fn number<T: std::str::FromStr>(s: &str, flag: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    s.parse::<T>().with_context(|| format!("{flag}: '{s}' is not a valid number"))
}

fn size(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("--size: expected WxH, got '{s}'"))?;
    let (w, h) = (number::<u32>(w, "--size")?, number::<u32>(h, "--size")?);
    if w == 0 || h == 0 {
        bail!("--size: dimensions must be non-zero");
    }
    Ok((w, h))
}

pub fn parse(args: &[String]) -> Result<Cli> {
    let mut log_file = None;
    let mut assets = None;
    let mut strict = false;
    let mut command: Option<Command> = None;

    let mut it = args.iter();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--log-file" => log_file = Some(PathBuf::from(value(&mut it, a)?)),
            "--assets" => assets = Some(PathBuf::from(value(&mut it, a)?)),
            "--strict" => strict = true,
            "-h" | "--help" | "help" => command = Some(Command::Help),
            "serve" => command = Some(Command::Serve(parse_serve(&mut it)?)),
            "consume" => command = Some(Command::Consume(parse_consume(&mut it)?)),
            "status" => {
                let name = it.next().cloned();
                if let Some(extra) = it.next() {
                    bail!("status: unexpected argument '{extra}'");
                }
                command = Some(Command::Status { name });
            }
            "check" => command = Some(Command::Check),
            other => bail!("unknown argument '{other}'"),
        }
        if command.is_some() {
            break;
        }
    }

    if log_file.is_none() {
        if let Ok(p) = std::env::var("FRAMECAST_LOG_FILE") {
            if !p.trim().is_empty() {
                log_file = Some(PathBuf::from(p));
            }
        }
    }

    Ok(Cli { log_file, assets, strict, command: command.unwrap_or(Command::Help) })
}

fn parse_serve<'a>(it: &mut impl Iterator<Item = &'a String>) -> Result<ServeOpts> {
    let mut o = ServeOpts::default();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--frames" => o.frames = number(value(it, a)?, a)?,
            "--seconds" => {
                let secs: f64 = number(value(it, a)?, a)?;
                if !secs.is_finite() || secs < 0.0 {
                    bail!("--seconds must be a non-negative number");
                }
                o.seconds = Some(secs);
            }
            "--fps" => {
                o.fps = number(value(it, a)?, a)?;
                if !(o.fps.is_finite() && o.fps > 0.0) {
                    bail!("--fps must be positive");
                }
            }
            "--size" => (o.width, o.height) = size(value(it, a)?)?,
            "--flip" => o.flip = true,
            "--fail-every" => {
                let n: u64 = number(value(it, a)?, a)?;
                o.fail_every = (n > 0).then_some(n);
            }
            other => bail!("serve: unknown option '{other}'"),
        }
    }
    Ok(o)
}

fn parse_consume<'a>(it: &mut impl Iterator<Item = &'a String>) -> Result<ConsumeOpts> {
    let mut o = ConsumeOpts::default();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--name" => o.name = Some(value(it, a)?.to_string()),
            "--addr" => o.addr = Some(value(it, a)?.to_string()),
            "--frames" => o.frames = number(value(it, a)?, a)?,
            "--timeout-ms" => o.timeout = Duration::from_millis(number(value(it, a)?, a)?),
            other => bail!("consume: unknown option '{other}'"),
        }
    }
    if o.name.is_some() && o.addr.is_some() {
        bail!("consume: use either --name or --addr, not both");
    }
    Ok(o)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn no_arguments_prints_help() {
        assert_eq!(parse(&[]).unwrap().command, Command::Help);
    }

    #[test]
    fn global_flags_before_command() {
        let cli = parse(&args("--log-file /tmp/fc.log --strict check")).unwrap();
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/fc.log")));
        assert!(cli.strict);
        assert_eq!(cli.command, Command::Check);
    }

    #[test]
    fn serve_options() {
        let cli = parse(&args("serve --frames 120 --fps 30 --size 1280x720 --flip --fail-every 10")).unwrap();
        let Command::Serve(o) = cli.command else { panic!("not serve") };
        assert_eq!(o.frames, 120);
        assert_eq!(o.fps, 30.0);
        assert_eq!((o.width, o.height), (1280, 720));
        assert!(o.flip);
        assert_eq!(o.fail_every, Some(10));
    }

    #[test]
    fn consume_options() {
        let cli = parse(&args("consume --name deck-a --frames 5 --timeout-ms 250")).unwrap();
        let Command::Consume(o) = cli.command else { panic!("not consume") };
        assert_eq!(o.name.as_deref(), Some("deck-a"));
        assert_eq!(o.frames, 5);
        assert_eq!(o.timeout, Duration::from_millis(250));
    }

    #[test]
    fn status_takes_optional_name() {
        assert_eq!(parse(&args("status")).unwrap().command, Command::Status { name: None });
        assert_eq!(
            parse(&args("status main")).unwrap().command,
            Command::Status { name: Some("main".into()) }
        );
    }

    #[test]
    fn seconds_may_be_fractional() {
        let cli = parse(&args("serve --seconds 2.5")).unwrap();
        let Command::Serve(o) = cli.command else { panic!("not serve") };
        assert_eq!(o.seconds, Some(2.5));
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(parse(&args("serve --size 0x10")).is_err());
        assert!(parse(&args("serve --fps nope")).is_err());
        assert!(parse(&args("serve --fps inf")).is_err());
        for bad in ["-1", "NaN", "inf"] {
            assert!(parse(&args(&format!("serve --seconds {bad}"))).is_err(), "--seconds {bad}");
        }
        assert!(parse(&args("consume --name a --addr 127.0.0.1:1")).is_err());
        assert!(parse(&args("serve --frames")).is_err());
        assert!(parse(&args("launch")).is_err());
    }
}
