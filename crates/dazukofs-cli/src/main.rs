use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, info, warn};

use dazukofs_core::{Access, Engine};
use dazukofs_dev::{DeviceClass, DeviceError, GroupHandle, DEVICE_NAME};

/// Mediate opens of the given paths through an in-process arbitration
/// session: one policy worker speaks the group-device protocol and votes on
/// every file before the open is granted.
#[derive(Parser)]
#[command(name = "dazukofs", version, about)]
struct Cli {
    /// Files to mediate, in order.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Group name the demo scanner registers under.
    #[arg(long, default_value = "demo", env = "DAZUKOFS_GROUP")]
    group: String,

    /// Deny access to files whose content contains this byte string.
    #[arg(long)]
    deny_content: Option<String>,

    /// Device-class name for the session.
    #[arg(long, default_value = DEVICE_NAME, env = "DAZUKOFS_CLASS")]
    class: String,
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(denied) => i32::from(denied > 0),
        Err(err) => {
            eprintln!("fatal: {err:?}");
            2
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<usize> {
    let engine = Arc::new(Engine::new());
    let class = DeviceClass::with_name(Arc::clone(&engine), &cli.class);

    let mut ctrl = class.open_ctrl();
    ctrl.write(format!("add={}", cli.group).as_bytes())
        .context("registering group")?;
    let group_id = find_group_id(&class, &cli.group)?;

    // Two logical processes: the requester on this thread, the scanner on
    // its own, each with its own identity.
    let base_pid = std::process::id();
    let scanner = class
        .open_group(group_id, base_pid.wrapping_add(1))
        .context("opening group device")?;
    let deny = cli.deny_content.as_ref().map(|s| s.clone().into_bytes());
    let worker = thread::spawn(move || scan_loop(scanner, deny));

    let requester = engine.pid(base_pid);
    let mut denied = 0;
    for path in &cli.paths {
        if let Err(err) = std::fs::metadata(path) {
            warn!(path = %path.display(), %err, "skipping unreadable path");
            println!("SKIP  {}", path.display());
            continue;
        }
        match engine.check_access(path, &requester) {
            Access::Allowed => println!("ALLOW {}", path.display()),
            Access::Denied => {
                denied += 1;
                println!("DENY  {}", path.display());
            }
        }
    }

    ctrl.write(format!("del={}", cli.group).as_bytes())
        .context("removing group")?;
    let scanned = match worker.join() {
        Ok(scanned) => scanned,
        Err(_) => bail!("scanner thread panicked"),
    };
    info!(scanned, denied, "session finished");

    engine.shutdown();
    Ok(denied)
}

/// Resolve the id our group got, through the control listing.
fn find_group_id(class: &DeviceClass, name: &str) -> anyhow::Result<usize> {
    let mut session = class.open_ctrl();
    let mut listing = Vec::new();
    let mut chunk = [0u8; 128];
    loop {
        let n = session.read(&mut chunk).context("reading group listing")?;
        if n == 0 {
            break;
        }
        listing.extend_from_slice(&chunk[..n]);
    }
    let listing = String::from_utf8(listing).context("group listing encoding")?;
    for line in listing.lines() {
        if let Some((id, entry)) = line.split_once(':') {
            if entry == name {
                return Ok(id.parse().context("group id")?);
            }
        }
    }
    bail!("group {name} is not registered")
}

/// The policy worker: claim events, inspect the file behind the installed
/// descriptor, answer. Ends when the group goes away.
fn scan_loop(mut group: GroupHandle, deny: Option<Vec<u8>>) -> usize {
    let mut scanned = 0;
    loop {
        let mut buf = [0u8; 64];
        let n = match group.read(&mut buf) {
            Ok(n) => n,
            Err(DeviceError::Engine(dazukofs_core::EngineError::Io(err))) => {
                warn!(%err, "subject could not be opened, leaving it queued");
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => {
                debug!(%err, "scanner finished");
                break;
            }
        };
        let Some((event_id, fd, requester)) = parse_event_line(&buf[..n]) else {
            warn!("unparseable event line");
            break;
        };

        let content = slurp(fd);
        let hit = deny
            .as_ref()
            .is_some_and(|needle| contains(&content, needle));
        info!(event = event_id, requester, bytes = content.len(), denied = hit, "scanned");

        let response = if hit { 1 } else { 0 };
        if group
            .write(format!("id={event_id}\nr={response}\n").as_bytes())
            .is_err()
        {
            break;
        }
        scanned += 1;
    }
    scanned
}

fn parse_event_line(buf: &[u8]) -> Option<(u64, i32, u32)> {
    let line = std::str::from_utf8(buf).ok()?;
    let mut fields = line.lines().filter_map(|l| l.split_once('='));
    let (_, id) = fields.find(|(key, _)| *key == "id")?;
    let mut fields = line.lines().filter_map(|l| l.split_once('='));
    let (_, fd) = fields.find(|(key, _)| *key == "fd")?;
    let mut fields = line.lines().filter_map(|l| l.split_once('='));
    let (_, pid) = fields.find(|(key, _)| *key == "pid")?;
    Some((id.parse().ok()?, fd.parse().ok()?, pid.parse().ok()?))
}

/// Read the whole file behind `fd` (capped at 1 MiB) and close it.
fn slurp(fd: i32) -> Vec<u8> {
    const CAP: usize = 1 << 20;
    let mut content = Vec::new();
    let mut chunk = [0u8; 4096];
    while content.len() < CAP {
        match nix::unistd::read(fd, &mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => content.extend_from_slice(&chunk[..n]),
        }
    }
    let _ = nix::unistd::close(fd);
    content
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_line() {
        assert_eq!(
            parse_event_line(b"id=4\nfd=12\npid=900\n"),
            Some((4, 12, 900))
        );
        assert_eq!(parse_event_line(b"nonsense"), None);
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"hello world", b"lo wo"));
        assert!(!contains(b"hello", b"world"));
        assert!(!contains(b"hello", b""));
    }
}
