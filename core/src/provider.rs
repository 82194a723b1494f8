use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// One ranked search hit on the media provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHandle {
    pub id: String,
    pub url: String,
    pub title: String,
}

/// One downloadable audio representation of a [`MediaHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    /// Bitrate label such as `128kbps`, if the provider knows one.
    pub abr: Option<String>,
    pub ext: String,
    pub filesize: Option<u64>,
}

pub type ByteProgress<'a> = &'a dyn Fn(u64, Option<u64>);

pub trait MediaProvider: Send + Sync {
    fn search(&self, query: &str) -> CoreResult<Vec<MediaHandle>>;
    fn streams(&self, handle: &MediaHandle) -> CoreResult<Vec<StreamInfo>>;
    /// Writes the stream into `dest_dir` as `<file_stem>.<ext>` and returns
    /// the final path.
    fn download(
        &self,
        handle: &MediaHandle,
        stream: &StreamInfo,
        dest_dir: &Path,
        file_stem: &str,
        progress: ByteProgress<'_>,
    ) -> CoreResult<PathBuf>;
}

/// Nominal audio bitrates of the itags the ladder understands.
const ITAG_BITRATES: &[(&str, &str)] = &[
    ("251", "160kbps"),
    ("140", "128kbps"),
    ("250", "70kbps"),
    ("249", "50kbps"),
    ("139", "48kbps"),
];

const PROGRESS_PREFIX: &str = "progress:";
const PATH_PREFIX: &str = "path:";

pub fn itag_bitrate(itag: &str) -> Option<&'static str> {
    ITAG_BITRATES
        .iter()
        .find(|(id, _)| *id == itag)
        .map(|(_, abr)| *abr)
}

#[derive(Debug, Clone)]
pub struct YtDlpProvider {
    bin: String,
    search_results: u32,
    call_timeout: Duration,
    download_timeout: Duration,
}

impl YtDlpProvider {
    pub fn new(
        bin: impl Into<String>,
        search_results: u32,
        call_timeout: Duration,
        download_timeout: Duration,
    ) -> Self {
        Self {
            bin: bin.into(),
            search_results: search_results.max(1),
            call_timeout,
            download_timeout,
        }
    }

    fn run_json<I, S>(&self, args: I) -> CoreResult<Value>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = command(&self.bin);
        cmd.args(args);
        let mut stdout = Vec::new();
        run_lines(cmd, self.call_timeout, |line| {
            stdout.extend_from_slice(line.as_bytes());
            stdout.push(b'\n');
        })
        .map_err(CoreError::Provider)?;
        serde_json::from_slice(&stdout).map_err(|err| CoreError::Provider(err.to_string()))
    }
}

impl MediaProvider for YtDlpProvider {
    fn search(&self, query: &str) -> CoreResult<Vec<MediaHandle>> {
        let target = format!("ytsearch{}:{}", self.search_results, query);
        let value = self.run_json([
            "--flat-playlist",
            "--dump-single-json",
            "--no-warnings",
            target.as_str(),
        ])?;
        Ok(parse_search(&value))
    }

    fn streams(&self, handle: &MediaHandle) -> CoreResult<Vec<StreamInfo>> {
        let value = self.run_json(["-J", "--no-warnings", handle.url.as_str()])?;
        Ok(parse_formats(&value))
    }

    fn download(
        &self,
        handle: &MediaHandle,
        stream: &StreamInfo,
        dest_dir: &Path,
        file_stem: &str,
        progress: ByteProgress<'_>,
    ) -> CoreResult<PathBuf> {
        let template = dest_dir.join(format!("{}.%(ext)s", file_stem));
        let mut cmd = command(&self.bin);
        cmd.arg("-f")
            .arg(&stream.id)
            .arg("-o")
            .arg(&template)
            .args(["--no-playlist", "--no-part", "--newline", "--no-warnings"])
            .args(["--progress", "--no-simulate"])
            .arg("--progress-template")
            .arg(format!(
                "download:{}%(progress.downloaded_bytes)s:%(progress.total_bytes)s",
                PROGRESS_PREFIX
            ))
            .arg("--print")
            .arg(format!("after_move:{}%(filepath)s", PATH_PREFIX))
            .arg(&handle.url);

        let mut final_path = None;
        run_lines(cmd, self.download_timeout, |line| {
            if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
                if let Some((downloaded, total)) = parse_progress(rest) {
                    progress(downloaded, total);
                }
            } else if let Some(path) = line.strip_prefix(PATH_PREFIX) {
                final_path = Some(PathBuf::from(path.trim()));
            }
        })
        .map_err(CoreError::StreamDownloadFailed)?;

        let path = final_path.ok_or_else(|| {
            CoreError::StreamDownloadFailed(format!("{} reported no output file", self.bin))
        })?;
        if !path.exists() {
            return Err(CoreError::StreamDownloadFailed(format!(
                "missing output file {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

fn parse_search(value: &Value) -> Vec<MediaHandle> {
    let Some(entries) = value.get("entries").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("id").and_then(Value::as_str)?.to_string();
            let url = entry
                .get("webpage_url")
                .or_else(|| entry.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", id));
            let title = entry
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some(MediaHandle { id, url, title })
        })
        .collect()
}

fn parse_formats(value: &Value) -> Vec<StreamInfo> {
    let Some(formats) = value.get("formats").and_then(Value::as_array) else {
        return Vec::new();
    };
    formats
        .iter()
        .filter(|format| {
            let audio = format.get("acodec").and_then(Value::as_str).unwrap_or("none");
            let video = format.get("vcodec").and_then(Value::as_str).unwrap_or("none");
            audio != "none" && video == "none"
        })
        .filter_map(|format| {
            let id = format.get("format_id").and_then(Value::as_str)?.to_string();
            let ext = format
                .get("ext")
                .and_then(Value::as_str)
                .unwrap_or("webm")
                .to_string();
            let filesize = format
                .get("filesize")
                .or_else(|| format.get("filesize_approx"))
                .and_then(Value::as_u64);
            Some(StreamInfo {
                abr: itag_bitrate(&id).map(str::to_string),
                id,
                ext,
                filesize,
            })
        })
        .collect()
}

fn parse_progress(rest: &str) -> Option<(u64, Option<u64>)> {
    let (downloaded, total) = rest.trim().split_once(':')?;
    let downloaded = downloaded.parse::<f64>().ok()? as u64;
    let total = total.parse::<f64>().ok().map(|value| value as u64);
    Some((downloaded, total))
}

fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

/// Runs `cmd`, feeding each stdout line to `on_line`, and kills the child's
/// process group once `timeout` elapses. Errors are plain messages so callers
/// can pick the error variant.
pub(crate) fn run_lines<F>(mut cmd: Command, timeout: Duration, mut on_line: F) -> Result<(), String>
where
    F: FnMut(&str),
{
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);
    let program = format!("{:?}", cmd.get_program());
    let mut child = cmd
        .spawn()
        .map_err(|err| format!("failed to start {}: {}", program, err))?;
    debug!(program = %program, pid = child.id(), "spawned child process");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| format!("{} has no stdout", program))?;
    let stderr = child.stderr.take();

    // Readers are never joined: a surviving descendant may hold the pipes open
    // past the deadline.
    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    let (err_tx, err_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf);
        }
        let _ = err_tx.send(buf);
    });

    let deadline = Instant::now() + timeout;
    let timed_out = || format!("{} timed out after {:?}", program, timeout);
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => on_line(&line),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if Instant::now() >= deadline {
            kill(&mut child);
            return Err(timed_out());
        }
    }

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill(&mut child);
                return Err(timed_out());
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(err) => return Err(err.to_string()),
        }
    };
    if !status.success() {
        let grace = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(100));
        let stderr = err_rx.recv_timeout(grace).unwrap_or_default();
        let detail = stderr.lines().last().unwrap_or("").trim().to_string();
        return Err(format!("{} exited with {}: {}", program, status, detail));
    }
    Ok(())
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

fn kill(child: &mut Child) {
    warn!(pid = child.id(), "killing timed out child process");
    kill_process_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // The child leads its own group, so this reaches its descendants too.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_are_labelled_from_itags() {
        let value: Value = serde_json::from_str(
            r#"{"formats":[
                {"format_id":"251","ext":"webm","acodec":"opus","vcodec":"none","filesize":100},
                {"format_id":"140","ext":"m4a","acodec":"mp4a.40.2","vcodec":"none"},
                {"format_id":"18","ext":"mp4","acodec":"mp4a.40.2","vcodec":"avc1"},
                {"format_id":"774","ext":"webm","acodec":"opus","vcodec":"none"}
            ]}"#,
        )
        .expect("json");
        let streams = parse_formats(&value);
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[0].abr.as_deref(), Some("160kbps"));
        assert_eq!(streams[0].filesize, Some(100));
        assert_eq!(streams[1].abr.as_deref(), Some("128kbps"));
        assert_eq!(streams[1].ext, "m4a");
        assert_eq!(streams[2].abr, None);
    }

    #[test]
    fn search_keeps_rank_order() {
        let value: Value = serde_json::from_str(
            r#"{"entries":[
                {"id":"one","title":"First","url":"https://www.youtube.com/watch?v=one"},
                {"id":"two","title":"Second"}
            ]}"#,
        )
        .expect("json");
        let hits = parse_search(&value);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "one");
        assert_eq!(hits[1].url, "https://www.youtube.com/watch?v=two");
        assert!(parse_search(&Value::Null).is_empty());
    }

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_is_killed_at_the_deadline() {
        let started = Instant::now();
        let err = run_lines(shell("sleep 5"), Duration::from_millis(300), |_| {})
            .unwrap_err();
        assert!(err.contains("timed out after 300ms"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn descendant_holding_stdout_does_not_extend_the_deadline() {
        let started = Instant::now();
        let mut lines = Vec::new();
        let err = run_lines(
            shell("echo first; sleep 4; echo done"),
            Duration::from_millis(300),
            |line| lines.push(line.to_string()),
        )
        .unwrap_err();
        assert!(err.contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(lines, vec!["first".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_last_stderr_line() {
        let err = run_lines(
            shell("echo out; echo noise >&2; echo broken >&2; exit 3"),
            Duration::from_secs(5),
            |_| {},
        )
        .unwrap_err();
        assert!(err.contains("broken"), "{}", err);
    }

    #[cfg(unix)]
    #[test]
    fn lines_arrive_in_order() {
        let mut lines = Vec::new();
        run_lines(shell("echo a; echo b"), Duration::from_secs(5), |line| {
            lines.push(line.to_string())
        })
        .expect("run");
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn progress_lines() {
        assert_eq!(parse_progress("512:1024"), Some((512, Some(1024))));
        assert_eq!(parse_progress("512:NA"), Some((512, None)));
        assert_eq!(parse_progress("garbage"), None);
    }
}
