use crate::error::EngineError;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// 请求停止前进程已经退出
    AlreadyExited(ExitStatus),
    /// 收到中断后在宽限期内自行退出
    Graceful(ExitStatus),
    /// 超时后被强制杀掉
    Forced,
}

impl Termination {
    pub fn was_forced(self) -> bool {
        matches!(self, Termination::Forced)
    }
}

/// 受监管的外部进程
///
/// 以 `kill_on_drop` 启动，任务被取消或 panic 时句柄被丢弃，进程随之被杀掉。
pub struct SupervisedChild {
    program: String,
    child: Child,
    exit: Option<ExitStatus>,
}

impl SupervisedChild {
    /// 启动进程；stdin 始终接管道，没有信号可用时通过写入 `q` 停止
    pub fn spawn(mut cmd: Command, program: &str) -> Result<Self, EngineError> {
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        let child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: program.to_string(),
            source,
        })?;
        debug!("Spawned {} (pid {:?})", program, child.id());
        Ok(Self {
            program: program.to_string(),
            child,
            exit: None,
        })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// 非阻塞地检查进程是否还在运行
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        self.exit = status;
        Ok(status)
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exit = Some(status);
        Ok(status)
    }

    /// 先发送中断，最多等待 `grace`，仍未退出则强制杀掉
    pub async fn terminate(&mut self, grace: Duration) -> Termination {
        match self.try_wait() {
            Ok(Some(status)) => return Termination::AlreadyExited(status),
            Ok(None) => {}
            Err(e) => warn!("Process monitor error [{}]: {}", self.program, e),
        }

        self.interrupt().await;
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(Ok(status)) => {
                info!("{} exited after interrupt with: {}", self.program, status);
                Termination::Graceful(status)
            }
            Ok(Err(e)) => {
                warn!("Waiting for {} failed: {}. Killing.", self.program, e);
                self.kill().await;
                Termination::Forced
            }
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}. Killing.",
                    self.program, grace
                );
                self.kill().await;
                Termination::Forced
            }
        }
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill {}: {}", self.program, e);
        }
        if let Ok(status) = self.child.wait().await {
            self.exit = Some(status);
        }
    }

    #[cfg(unix)]
    async fn interrupt(&mut self) {
        if let Some(pid) = self.child.id() {
            // 发送 SIGINT，让 ffmpeg 写完并关闭容器
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc != 0 {
                warn!(
                    "Failed to interrupt {} (pid {}): {}",
                    self.program,
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(unix))]
    async fn interrupt(&mut self) {
        use tokio::io::AsyncWriteExt;
        if let Some(stdin) = self.child.stdin.as_mut() {
            if let Err(e) = stdin.write_all(b"q").await {
                warn!("Failed to send quit to {}: {}", self.program, e);
            }
            let _ = stdin.flush().await;
        }
    }
}
