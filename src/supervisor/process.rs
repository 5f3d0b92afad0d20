//! Client process plumbing: spawning, output capture, waiting and termination
//!
//! Each spawned client gets one wait task (this module's [`supervise`]) plus one
//! pump task per output pipe. The wait task is the only place that blocks on the
//! process; it reports back to the supervisor through [`ProcessEvent`] messages.

use crate::platform::{self, Elevation, GroupKill, Launch, PlatformError};
use crate::vpn::EnvBinding;
use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long output pumps may lag behind process exit before being detached
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest unterminated line held for logging and marker matching
const MAX_LINE_BYTES: usize = 4096;

const PRIVILEGED_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// What counts as an established tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Readiness {
    /// The client exiting with status 0 means connected
    #[default]
    ExitCode,
    /// An output line containing this text means connected; the client keeps running
    OutputMarker(String),
}

/// Keeps the last `limit` bytes of combined client output
#[derive(Debug)]
pub struct DiagnosticTail {
    limit: usize,
    buf: VecDeque<u8>,
}

impl DiagnosticTail {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: VecDeque::with_capacity(limit.min(64 * 1024)),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.limit == 0 {
            return;
        }
        if bytes.len() >= self.limit {
            self.buf.clear();
            self.buf.extend(&bytes[bytes.len() - self.limit..]);
            return;
        }
        self.buf.extend(bytes);
        let excess = self.buf.len().saturating_sub(self.limit);
        self.buf.drain(..excess);
    }

    pub fn snapshot(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

/// Outcome of a supervisor-requested stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// The client had to be killed outright
    pub forced: bool,
}

#[derive(Debug)]
pub(crate) enum ProcessExit {
    /// The client exited on its own
    Natural(ExitStatus),
    /// The supervisor stopped the client
    Terminated(Result<Termination, String>),
    WaitFailed(String),
}

#[derive(Debug)]
pub(crate) enum ProcessEvent {
    Ready {
        generation: u64,
    },
    Exited {
        generation: u64,
        exit: ProcessExit,
        diagnostic: String,
    },
}

pub(crate) struct SessionConfig {
    pub generation: u64,
    pub elevation: Arc<dyn Elevation>,
    pub grace_period: Duration,
    pub diagnostic_limit: usize,
    pub readiness: Readiness,
}

/// Start the client with credentials scoped to its own environment
///
/// On Unix the client leads a new process group so that anything it forks can be
/// stopped along with it.
pub(crate) fn spawn_client(launch: Launch, env: &[EnvBinding]) -> io::Result<Child> {
    let mut command = launch.into_command();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    for binding in env {
        command.env(binding.name, binding.expose());
    }
    command.spawn()
}

/// Own `child` until it exits or `cancel` fires, then report to the supervisor
pub(crate) async fn supervise(
    mut child: Child,
    session: SessionConfig,
    mut cancel: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let generation = session.generation;
    let tail = Arc::new(Mutex::new(DiagnosticTail::new(session.diagnostic_limit)));
    let ready = match session.readiness {
        Readiness::OutputMarker(marker) => Some(ReadySignal {
            marker: Arc::from(marker),
            fired: Arc::new(AtomicBool::new(false)),
            generation,
            events: events.clone(),
        }),
        Readiness::ExitCode => None,
    };

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, tail.clone(), ready.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, tail.clone(), ready)));
    }

    // A dropped sender means the session was abandoned; stop the client either way
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut cancel => None,
    };
    let exit = match waited {
        Some(Ok(status)) => {
            debug!("Client exited: {}", status);
            ProcessExit::Natural(status)
        }
        Some(Err(e)) => {
            warn!("Waiting on client failed: {}", e);
            ProcessExit::WaitFailed(e.to_string())
        }
        None => ProcessExit::Terminated(
            terminate(&mut child, session.grace_period, session.elevation.as_ref()).await,
        ),
    };

    drain(pumps).await;
    let diagnostic = tail.lock().unwrap_or_else(|e| e.into_inner()).snapshot();
    let _ = events.send(ProcessEvent::Exited {
        generation,
        exit,
        diagnostic,
    });
}

/// Graceful stop, then a forceful kill once `grace` runs out
///
/// Whatever the client forked into its process group goes down with it.
async fn terminate(
    child: &mut Child,
    grace: Duration,
    elevation: &dyn Elevation,
) -> Result<Termination, String> {
    let Some(pid) = child.id() else {
        return Ok(Termination { forced: false });
    };

    let mut forced = true;
    match platform::request_termination(pid) {
        Ok(()) => {
            debug!("Sent termination request to client pid {}", pid);
            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Client pid {} stopped ({})", pid, status);
                    forced = false;
                }
                Ok(Err(e)) => warn!("Waiting on client pid {} failed: {}", pid, e),
                Err(_) => warn!(
                    "Client pid {} still running after {:?}, killing",
                    pid, grace
                ),
            }
        }
        Err(PlatformError::GracefulStopUnsupported) => {
            debug!("No graceful stop on this platform, killing pid {}", pid);
        }
        Err(e) => warn!("{}; killing", e),
    }

    if forced {
        // the group has to be signalled while its leader still holds the id
        if let Err(e) = platform::kill_process_group(pid) {
            debug!("{}", e);
        }
        child
            .kill()
            .await
            .map_err(|e| format!("failed to kill client pid {}: {}", pid, e))?;
        info!("Client pid {} killed", pid);
    }

    reap_group(pid, elevation).await?;
    Ok(Termination { forced })
}

/// Kill processes that outlived the client in its group
async fn reap_group(pgid: u32, elevation: &dyn Elevation) -> Result<(), String> {
    match platform::kill_process_group(pgid).map_err(|e| e.to_string())? {
        GroupKill::Gone => Ok(()),
        GroupKill::Signalled => {
            debug!("Killed leftover processes in group {}", pgid);
            Ok(())
        }
        GroupKill::NotPermitted => privileged_kill(pgid, elevation).await,
    }
}

async fn privileged_kill(pgid: u32, elevation: &dyn Elevation) -> Result<(), String> {
    let Some(launch) = elevation.privileged_kill(pgid) else {
        return Err(format!(
            "processes in group {} are still running and cannot be signalled",
            pgid
        ));
    };
    info!(
        "Killing privileged processes in group {} via {}",
        pgid,
        elevation.name()
    );

    let mut command = launch.into_command();
    command.stdin(Stdio::null()).kill_on_drop(true);
    match timeout(PRIVILEGED_KILL_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => Err(format!(
            "{} kill of group {} failed ({}): {}",
            elevation.name(),
            pgid,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Ok(Err(e)) => Err(format!("failed to run {} kill: {}", elevation.name(), e)),
        Err(_) => Err(format!("{} kill of group {} timed out", elevation.name(), pgid)),
    }
}

async fn drain(pumps: Vec<tokio::task::JoinHandle<()>>) {
    let aborts: Vec<_> = pumps.iter().map(|p| p.abort_handle()).collect();
    let joined = timeout(PUMP_DRAIN_TIMEOUT, async {
        for pump in pumps {
            let _ = pump.await;
        }
    })
    .await;
    if joined.is_err() {
        // Something the client forked still holds the pipes open
        debug!("Client output still open after exit, detaching readers");
        for abort in aborts {
            abort.abort();
        }
    }
}

#[derive(Clone)]
struct ReadySignal {
    marker: Arc<str>,
    fired: Arc<AtomicBool>,
    generation: u64,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl ReadySignal {
    fn check(&self, line: &str) {
        if line.contains(&*self.marker) && !self.fired.swap(true, Ordering::SeqCst) {
            debug!("Readiness marker seen");
            let _ = self.events.send(ProcessEvent::Ready {
                generation: self.generation,
            });
        }
    }
}

/// Splits client output into lines without holding more than a bounded prefix
///
/// An unterminated line is flushed once it passes `MAX_LINE_BYTES`; the last
/// `carry` bytes stay behind so a marker split across the flush still matches.
struct LineBuffer {
    pending: Vec<u8>,
    carry: usize,
}

impl LineBuffer {
    fn new(carry: usize) -> Self {
        Self {
            pending: Vec::new(),
            carry,
        }
    }

    fn feed(&mut self, chunk: &[u8], mut on_line: impl FnMut(&[u8])) {
        for segment in chunk.split_inclusive(|&b| b == b'\n') {
            self.pending.extend_from_slice(segment);
            if segment.ends_with(b"\n") {
                on_line(&self.pending);
                self.pending.clear();
            } else if self.pending.len() > MAX_LINE_BYTES {
                on_line(&self.pending);
                let keep = self.carry.min(self.pending.len());
                self.pending.drain(..self.pending.len() - keep);
            }
        }
    }

    fn finish(&mut self, mut on_line: impl FnMut(&[u8])) {
        if !self.pending.is_empty() {
            on_line(&self.pending);
            self.pending.clear();
        }
    }
}

async fn pump<R>(reader: R, tail: Arc<Mutex<DiagnosticTail>>, ready: Option<ReadySignal>)
where
    R: AsyncRead + Unpin,
{
    let carry = ready
        .as_ref()
        .map_or(0, |r| r.marker.len().saturating_sub(1));
    let mut lines = LineBuffer::new(carry);
    let on_line = |line: &[u8]| {
        let text = String::from_utf8_lossy(line);
        let text = text.trim_end();
        debug!(target: "vyper::client", "{}", text);
        if let Some(ready) = &ready {
            ready.check(text);
        }
    };

    let mut reader = BufReader::new(reader);
    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Client output read failed: {}", e);
                break;
            }
        };
        let len = chunk.len();
        tail.lock().unwrap_or_else(|e| e.into_inner()).push(chunk);
        lines.feed(chunk, on_line);
        reader.consume(len);
    }
    lines.finish(on_line);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::platform::NoElevation;

    /// Alive and not a zombie
    #[cfg(target_os = "linux")]
    pub(crate) fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // the state letter follows the parenthesised command name
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.trim_start().chars().next())
                .is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    pub(crate) async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..40 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn collect_lines(buffer: &mut LineBuffer, chunks: &[&[u8]]) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in chunks {
            buffer.feed(chunk, |line| {
                lines.push(String::from_utf8_lossy(line).into_owned())
            });
        }
        lines
    }

    #[test]
    fn test_tail_keeps_last_bytes() {
        let mut tail = DiagnosticTail::new(8);
        tail.push(b"hello ");
        tail.push(b"world\n");
        assert_eq!(tail.snapshot(), "lo world");
    }

    #[test]
    fn test_tail_oversized_chunk() {
        let mut tail = DiagnosticTail::new(4);
        tail.push(b"ab");
        tail.push(b"0123456789");
        assert_eq!(tail.snapshot(), "6789");
    }

    #[test]
    fn test_tail_zero_limit() {
        let mut tail = DiagnosticTail::new(0);
        tail.push(b"anything");
        assert_eq!(tail.snapshot(), "");
    }

    #[test]
    fn test_tail_lossy_utf8() {
        let mut tail = DiagnosticTail::new(64);
        tail.push(&[b'o', b'k', 0xff, b'\n']);
        assert_eq!(tail.snapshot(), "ok\u{fffd}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_client_scopes_env_to_child() {
        use crate::vpn::CredentialBroker;

        let broker = CredentialBroker::new();
        broker.capture(Some("alice".into()), None);
        let env = broker.consume_for_environment();
        let launch = Launch::new(
            "/bin/sh",
            vec!["-c".into(), "printf '%s' \"$OPENVPN_USERNAME\"".into()],
        );

        let child = spawn_client(launch, &env).unwrap();
        let output = child.wait_with_output().await.unwrap();

        assert_eq!(String::from_utf8_lossy(&output.stdout), "alice");
        assert!(std::env::var_os("OPENVPN_USERNAME").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_escalates_when_term_ignored() {
        let launch = Launch::new(
            "/bin/sh",
            vec!["-c".into(), "trap '' TERM; echo up; exec sleep 30".into()],
        );
        let mut child = spawn_client(launch, &[]).unwrap();
        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "up");

        let started = std::time::Instant::now();
        let result = terminate(&mut child, Duration::from_millis(200), &NoElevation).await;

        assert_eq!(result, Ok(Termination { forced: true }));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_graceful() {
        let launch = Launch::new("/bin/sh", vec!["-c".into(), "echo up; exec sleep 30".into()]);
        let mut child = spawn_client(launch, &[]).unwrap();
        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();

        let result = terminate(&mut child, Duration::from_secs(5), &NoElevation).await;
        assert_eq!(result, Ok(Termination { forced: false }));
    }

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut buffer = LineBuffer::new(0);
        let lines = collect_lines(&mut buffer, &[b"first\nsec", b"ond\nthi"]);
        assert_eq!(lines, vec!["first\n", "second\n"]);

        let mut rest = Vec::new();
        buffer.finish(|line| rest.push(line.to_vec()));
        assert_eq!(rest, vec![b"thi".to_vec()]);
    }

    #[test]
    fn test_line_buffer_bounds_unterminated_output() {
        let mut buffer = LineBuffer::new(4);
        let chunk = vec![b'x'; 1024];
        for _ in 0..1024 {
            buffer.feed(&chunk, |_| {});
            assert!(buffer.pending.len() <= MAX_LINE_BYTES + chunk.len());
        }
    }

    #[test]
    fn test_line_buffer_carries_marker_prefix_over_flush() {
        let mut buffer = LineBuffer::new("ready".len() - 1);
        let mut long = vec![b'x'; MAX_LINE_BYTES];
        long.extend_from_slice(b"rea");

        let lines = collect_lines(&mut buffer, &[&long, b"dy\n"]);

        assert_eq!(lines.len(), 2);
        assert!(!lines[0].contains("ready"));
        assert_eq!(lines[1], "xready\n");
    }

    #[tokio::test]
    async fn test_pump_bounded_on_output_without_newlines() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let ready = ReadySignal {
            marker: Arc::from("ready"),
            fired: Arc::new(AtomicBool::new(false)),
            generation: 7,
            events: events_tx,
        };
        let mut output = vec![b'y'; 1 << 20];
        output.extend_from_slice(b"ready\n");
        let tail = Arc::new(Mutex::new(DiagnosticTail::new(8 * 1024)));

        pump(&output[..], tail.clone(), Some(ready)).await;

        let snapshot = tail.lock().unwrap().snapshot();
        assert!(snapshot.len() <= 8 * 1024);
        assert!(snapshot.ends_with("yready"));
        assert!(matches!(
            events_rx.try_recv(),
            Ok(ProcessEvent::Ready { generation: 7 })
        ));
        assert!(events_rx.try_recv().is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_kills_forked_workers() {
        let launch = Launch::new(
            "/bin/sh",
            vec!["-c".into(), "trap '' TERM; sleep 30 & echo $!; wait".into()],
        );
        let mut child = spawn_client(launch, &[]).unwrap();
        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        let worker: u32 = line.trim().parse().unwrap();
        assert!(is_running(worker));

        let result = terminate(&mut child, Duration::from_millis(200), &NoElevation).await;

        assert_eq!(result, Ok(Termination { forced: true }));
        assert!(wait_until_gone(worker).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_reaps_workers_outliving_client() {
        // the worker ignores TERM while the client itself stops on it
        let launch = Launch::new(
            "/bin/sh",
            vec![
                "-c".into(),
                "(trap '' TERM; exec sleep 30) & echo $!; exec sleep 30".into(),
            ],
        );
        let mut child = spawn_client(launch, &[]).unwrap();
        let mut stdout = BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).await.unwrap();
        let worker: u32 = line.trim().parse().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = terminate(&mut child, Duration::from_secs(5), &NoElevation).await;

        assert_eq!(result, Ok(Termination { forced: false }));
        assert!(wait_until_gone(worker).await);
    }
}
