//! The process on the other end of a session
//!
//! The session only needs to know whether its peer is still alive, how to
//! interrupt it and how to make it go away. [`ChildPeer`] wraps a spawned
//! remote process; [`TaskPeer`] wraps a remote served from a task in this
//! process.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{GraftError, GraftResult};

/// Lifecycle operations on a session's remote
#[async_trait]
pub trait PeerProcess: Send {
    /// Process id, when the peer is a process
    fn id(&self) -> Option<u32>;

    /// Exit status if the peer has already exited; never blocks
    fn try_exit_status(&mut self) -> Option<String>;

    /// Ask the peer to abort its current call
    fn interrupt(&mut self) -> GraftResult<()>;

    /// Wait up to `timeout` for the peer to exit
    async fn wait(&mut self, timeout: Duration) -> Option<String>;

    /// Terminate the peer forcefully
    async fn kill(&mut self);
}

/// Where the remote's stdout goes
#[derive(Debug, Clone, Default)]
pub enum OutputEcho {
    /// Local stdout
    #[default]
    Console,
    /// Line by line into a channel
    Channel(mpsc::UnboundedSender<String>),
    /// Not captured at all
    Discard,
}

/// A remote running as a child process
#[derive(Debug)]
pub struct ChildPeer {
    child: Child,
    echo: Option<JoinHandle<()>>,
}

impl ChildPeer {
    /// Take ownership of `child`, echoing its stdout if it was piped
    pub fn new(mut child: Child, echo: OutputEcho) -> Self {
        let echo = child.stdout.take().map(|stdout| spawn_echo(stdout, echo));
        Self { child, echo }
    }
}

#[async_trait]
impl PeerProcess for ChildPeer {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> GraftResult<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| GraftError::Launch(format!("pid {} out of range", pid)))?;
        debug!(pid, "Sending SIGINT to remote");
        kill(Pid::from_raw(pid), Signal::SIGINT)
            .map_err(|e| GraftError::Launch(format!("failed to interrupt remote: {}", e)))
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> GraftResult<()> {
        warn!("Interrupting the remote is not supported on this platform");
        Ok(())
    }

    async fn wait(&mut self, timeout: Duration) -> Option<String> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status.to_string()),
            Ok(Err(e)) => Some(format!("unknown ({})", e)),
            Err(_) => None,
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill remote: {}", e);
        }
        if let Some(echo) = self.echo.take() {
            echo.abort();
        }
    }
}

/// Forward the remote's stdout until it closes
fn spawn_echo(stdout: ChildStdout, echo: OutputEcho) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match &echo {
                    OutputEcho::Console => println!("{}", line),
                    OutputEcho::Channel(tx) => {
                        let _ = tx.send(line);
                    }
                    OutputEcho::Discard => {}
                },
                Ok(None) => break,
                Err(e) => {
                    debug!("Remote output stream ended: {}", e);
                    break;
                }
            }
        }
    })
}

/// A remote served by a task inside this process
pub struct TaskPeer {
    task: JoinHandle<()>,
    on_interrupt: Box<dyn Fn() + Send + Sync>,
    finished: bool,
}

impl TaskPeer {
    /// Spawn `serve`; `on_interrupt` is what an interrupt does to it
    pub fn spawn<F, I>(serve: F, on_interrupt: I) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
        I: Fn() + Send + Sync + 'static,
    {
        Self {
            task: tokio::spawn(serve),
            on_interrupt: Box::new(on_interrupt),
            finished: false,
        }
    }

    fn status(&self) -> String {
        if self.task.is_finished() {
            "remote task finished".to_string()
        } else {
            "remote task aborted".to_string()
        }
    }
}

#[async_trait]
impl PeerProcess for TaskPeer {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_exit_status(&mut self) -> Option<String> {
        if self.finished || self.task.is_finished() {
            self.finished = true;
            Some(self.status())
        } else {
            None
        }
    }

    fn interrupt(&mut self) -> GraftResult<()> {
        (self.on_interrupt)();
        Ok(())
    }

    async fn wait(&mut self, timeout: Duration) -> Option<String> {
        if !self.finished {
            if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
                return None;
            }
            self.finished = true;
        }
        Some(self.status())
    }

    async fn kill(&mut self) {
        self.task.abort();
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_peer_lifecycle() {
        let raised = Arc::new(AtomicBool::new(false));
        let flag = raised.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut peer = TaskPeer::spawn(
            async move {
                let _ = rx.await;
            },
            move || flag.store(true, Ordering::SeqCst),
        );

        assert_eq!(peer.try_exit_status(), None);
        peer.interrupt().unwrap();
        assert!(raised.load(Ordering::SeqCst));
        assert_eq!(peer.wait(Duration::from_millis(10)).await, None);

        tx.send(()).unwrap();
        assert!(peer.wait(Duration::from_secs(5)).await.is_some());
        assert!(peer.try_exit_status().is_some());
        assert!(peer.wait(Duration::from_millis(1)).await.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_peer_echo_and_exit() {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo first; echo second")
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut peer = ChildPeer::new(child, OutputEcho::Channel(tx));

        assert!(peer.wait(Duration::from_secs(5)).await.is_some());
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert_eq!(rx.recv().await.as_deref(), Some("second"));
        assert!(peer.try_exit_status().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_peer_kill() {
        let child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut peer = ChildPeer::new(child, OutputEcho::Discard);
        assert_eq!(peer.try_exit_status(), None);
        peer.kill().await;
        assert!(peer.wait(Duration::from_secs(5)).await.is_some());
    }
}
