//! Background self-update check against a git remote.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::provider::run_lines;

pub trait VersionControl: Send + Sync {
    fn local_revision(&self) -> CoreResult<String>;
    /// Fetches and returns the tip of the tracked remote branch.
    fn remote_revision(&self) -> CoreResult<String>;
    /// Discards local divergence and moves to the remote tip.
    fn reset_to_remote(&self) -> CoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct GitRepository {
    pub workdir: PathBuf,
    pub remote: String,
    pub branch: String,
    pub timeout: Duration,
}

impl GitRepository {
    pub fn new(workdir: impl Into<PathBuf>, remote: &str, branch: &str) -> Self {
        Self {
            workdir: workdir.into(),
            remote: remote.to_string(),
            branch: branch.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    fn remote_ref(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    fn git(&self, args: &[&str]) -> CoreResult<String> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.workdir).args(args).stdin(Stdio::null());
        let mut out = Vec::new();
        run_lines(cmd, self.timeout, |line| out.push(line.trim().to_string()))
            .map_err(CoreError::Vcs)?;
        Ok(out.join("\n"))
    }
}

impl VersionControl for GitRepository {
    fn local_revision(&self) -> CoreResult<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    fn remote_revision(&self) -> CoreResult<String> {
        self.git(&["fetch", "--quiet", &self.remote, &self.branch])?;
        self.git(&["rev-parse", &self.remote_ref()])
    }

    fn reset_to_remote(&self) -> CoreResult<()> {
        self.git(&["reset", "--hard", "--quiet", &self.remote_ref()])
            .map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate(String),
    Updated { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub from: String,
    pub to: String,
}

pub struct UpdateChecker {
    vcs: Arc<dyn VersionControl>,
    interval: Duration,
}

impl UpdateChecker {
    pub fn new(vcs: Arc<dyn VersionControl>, interval: Duration) -> Self {
        Self { vcs, interval }
    }

    pub fn check_once(&self) -> CoreResult<UpdateOutcome> {
        let local = self.vcs.local_revision()?;
        let remote = self.vcs.remote_revision()?;
        if local == remote {
            debug!(revision = %local, "already up to date");
            return Ok(UpdateOutcome::UpToDate(local));
        }
        info!(from = %local, to = %remote, "remote moved, resetting");
        self.vcs.reset_to_remote()?;
        Ok(UpdateOutcome::Updated {
            from: local,
            to: remote,
        })
    }

    /// Starts the periodic loop on its own thread. The first check runs
    /// immediately.
    pub fn spawn(self) -> UpdateHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let stop_clone = Arc::clone(&stop);
        let handle = thread::spawn(move || self.run(&stop_clone, &tx));
        UpdateHandle {
            stop,
            restarts: rx,
            handle: Some(handle),
        }
    }

    fn run(&self, stop: &AtomicBool, restarts: &Sender<RestartRequest>) {
        while !stop.load(Ordering::SeqCst) {
            match self.check_once() {
                Ok(UpdateOutcome::UpToDate(_)) => {}
                Ok(UpdateOutcome::Updated { from, to }) => {
                    let _ = restarts.send(RestartRequest { from, to });
                    return;
                }
                Err(err) => warn!(error = %err, "update check failed"),
            }
            sleep_unless_stopped(self.interval, stop);
        }
    }
}

fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

pub struct UpdateHandle {
    stop: Arc<AtomicBool>,
    restarts: Receiver<RestartRequest>,
    handle: Option<JoinHandle<()>>,
}

impl UpdateHandle {
    pub fn restart_requests(&self) -> &Receiver<RestartRequest> {
        &self.restarts
    }

    pub fn try_restart_request(&self) -> Option<RestartRequest> {
        self.restarts.try_recv().ok()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UpdateHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeRepo {
        local: Mutex<String>,
        remote: String,
        resets: Mutex<usize>,
        remote_failures: Mutex<usize>,
    }

    impl FakeRepo {
        fn new(local: &str, remote: &str) -> Arc<Self> {
            Arc::new(Self {
                local: Mutex::new(local.to_string()),
                remote: remote.to_string(),
                resets: Mutex::new(0),
                remote_failures: Mutex::new(0),
            })
        }

        fn failing_remote(local: &str, remote: &str, failures: usize) -> Arc<Self> {
            let repo = Self::new(local, remote);
            *repo.remote_failures.lock().expect("lock") = failures;
            repo
        }
    }

    impl VersionControl for FakeRepo {
        fn local_revision(&self) -> CoreResult<String> {
            Ok(self.local.lock().expect("lock").clone())
        }

        fn remote_revision(&self) -> CoreResult<String> {
            let mut failures = self.remote_failures.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(CoreError::Vcs("fetch failed".to_string()));
            }
            Ok(self.remote.clone())
        }

        fn reset_to_remote(&self) -> CoreResult<()> {
            *self.local.lock().expect("lock") = self.remote.clone();
            *self.resets.lock().expect("lock") += 1;
            Ok(())
        }
    }

    #[test]
    fn same_revision_is_a_no_op() {
        let repo = FakeRepo::new("abc", "abc");
        let checker = UpdateChecker::new(repo.clone(), Duration::from_secs(60));
        assert_eq!(
            checker.check_once().expect("check"),
            UpdateOutcome::UpToDate("abc".to_string())
        );
        assert_eq!(*repo.resets.lock().expect("lock"), 0);
    }

    #[test]
    fn divergence_resets_and_requests_restart() {
        let repo = FakeRepo::new("old", "new");
        let handle = UpdateChecker::new(repo.clone(), Duration::from_millis(10)).spawn();
        let request = handle
            .restart_requests()
            .recv_timeout(Duration::from_secs(5))
            .expect("restart request");
        assert_eq!(
            request,
            RestartRequest {
                from: "old".to_string(),
                to: "new".to_string()
            }
        );
        assert_eq!(repo.local_revision().expect("local"), "new");
        assert_eq!(*repo.resets.lock().expect("lock"), 1);
        handle.stop();
    }

    #[test]
    fn failed_check_keeps_the_loop_alive() {
        let repo = FakeRepo::failing_remote("old", "new", 2);
        let handle = UpdateChecker::new(repo.clone(), Duration::from_millis(10)).spawn();
        let request = handle
            .restart_requests()
            .recv_timeout(Duration::from_secs(5))
            .expect("restart request after failures");
        assert_eq!(request.to, "new");
        assert_eq!(*repo.remote_failures.lock().expect("lock"), 0);
        assert_eq!(*repo.resets.lock().expect("lock"), 1);
        handle.stop();
    }

    #[test]
    fn stop_interrupts_the_sleep() {
        let repo = FakeRepo::new("same", "same");
        let handle = UpdateChecker::new(repo, Duration::from_secs(3600)).spawn();
        let started = Instant::now();
        thread::sleep(Duration::from_millis(50));
        assert!(handle.is_running());
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
