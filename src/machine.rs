use crate::config::RetryPolicy;
use crate::error::EngineError;
use crate::model::{ErrorKind, MonitoredUser, Phase, RecordOutcome, ResolvedStream, WatchState};
use chrono::Utc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTrigger {
    /// 常规轮询
    Timer,
    /// 临时错误后的退避重试
    Retry,
    /// 录制进程中途退出后重新解析续录
    Resume,
    /// 控制端手动检查
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    LiveDetected(ResolvedStream),
    NeedsCookies,
    ScheduleRetry(Duration),
    /// 向用户报告错误；临时错误重试耗尽时 `gave_up` 为 true
    Surface { kind: ErrorKind, failures: u32, gave_up: bool },
}

/// 单个账号的监控状态机
///
/// 只负责状态转移：watcher 任务喂入触发和解析结果，再执行返回的 Effect。
/// 这里不做任何 I/O，也不碰定时器。
#[derive(Debug, Clone)]
pub struct WatchMachine {
    state: WatchState,
    retry: RetryPolicy,
}

impl WatchMachine {
    pub fn new(user: MonitoredUser, retry: RetryPolicy) -> Self {
        Self {
            state: WatchState::new(user),
            retry,
        }
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn handle(&self) -> &str {
        &self.state.user.handle
    }

    /// 进入 `Checking`；返回 `Ok(false)` 表示当前状态下忽略该触发
    pub fn begin_check(&mut self, trigger: CheckTrigger) -> Result<bool, EngineError> {
        let allowed = match (self.state.phase, trigger) {
            (Phase::Checking, _) => false,
            // 暂停监控时只响应手动检查
            (_, CheckTrigger::Timer | CheckTrigger::Retry | CheckTrigger::Resume)
                if !self.state.user.enabled =>
            {
                false
            }
            (Phase::Recording, CheckTrigger::Manual) => {
                return Err(self.invalid("check"));
            }
            (Phase::Recording, _) => false,
            (Phase::Error, CheckTrigger::Manual) => true,
            (Phase::Error, CheckTrigger::Retry) => self
                .state
                .last_error
                .map(ErrorKind::is_transient)
                .unwrap_or(false),
            (Phase::Error, CheckTrigger::Resume) => {
                self.state.last_error == Some(ErrorKind::ProcessFailure)
            }
            (Phase::Error, CheckTrigger::Timer) => false,
            (_, CheckTrigger::Retry | CheckTrigger::Resume) => false,
            (Phase::Idle | Phase::Offline | Phase::Live | Phase::Stopped, _) => true,
        };
        if allowed {
            self.state.phase = Phase::Checking;
            self.state.last_checked_at = Some(Utc::now());
        }
        Ok(allowed)
    }

    /// 应用解析结果；不在 `Checking` 时到达的结果已过期，直接忽略
    pub fn on_resolved(&mut self, outcome: Result<ResolvedStream, ErrorKind>) -> Vec<Effect> {
        if self.state.phase != Phase::Checking {
            return Vec::new();
        }
        match outcome {
            Ok(stream) => {
                self.state.phase = Phase::Live;
                self.state.consecutive_failures = 0;
                self.state.last_error = None;
                vec![Effect::LiveDetected(stream)]
            }
            Err(ErrorKind::NotLive) => {
                self.state.phase = Phase::Offline;
                self.state.consecutive_failures = 0;
                self.state.last_error = None;
                Vec::new()
            }
            Err(ErrorKind::AuthRequired) => {
                self.state.phase = Phase::Error;
                self.state.last_error = Some(ErrorKind::AuthRequired);
                vec![Effect::NeedsCookies]
            }
            Err(kind) if kind.is_transient() => {
                self.state.consecutive_failures += 1;
                self.state.last_error = Some(kind);
                let failures = self.state.consecutive_failures;
                if failures >= self.retry.max_attempts.max(1) {
                    // 放弃本轮，回到 Idle 等下一次常规轮询；下一轮重新计数
                    self.state.phase = Phase::Idle;
                    self.state.consecutive_failures = 0;
                    vec![Effect::Surface {
                        kind,
                        failures,
                        gave_up: true,
                    }]
                } else {
                    self.state.phase = Phase::Error;
                    vec![Effect::ScheduleRetry(self.retry.delay_for(failures, kind))]
                }
            }
            Err(kind) => {
                self.state.phase = Phase::Error;
                self.state.last_error = Some(kind);
                vec![Effect::Surface {
                    kind,
                    failures: self.state.consecutive_failures,
                    gave_up: false,
                }]
            }
        }
    }

    /// 不在 `phase` 状态时拒绝 `action`，不修改状态
    pub fn require(&self, phase: Phase, action: &'static str) -> Result<(), EngineError> {
        if self.state.phase != phase {
            return Err(self.invalid(action));
        }
        Ok(())
    }

    pub fn begin_recording(&mut self) -> Result<(), EngineError> {
        self.require(Phase::Live, "start recording")?;
        self.state.phase = Phase::Recording;
        Ok(())
    }

    /// 离开 `Recording`：用户主动停止进入 `Stopped`，
    /// 非主动的中断进入 `Error` 并记为 `ProcessFailure`
    pub fn finish_recording(&mut self, outcome: RecordOutcome, requested: bool) {
        if self.state.phase != Phase::Recording {
            return;
        }
        if requested || outcome == RecordOutcome::Completed {
            self.state.phase = Phase::Stopped;
        } else {
            self.state.phase = Phase::Error;
            self.state.last_error = Some(ErrorKind::ProcessFailure);
        }
    }

    /// 切换定时轮询开关，返回是否真的变了；不影响进行中的录制
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.state.user.enabled == enabled {
            return false;
        }
        self.state.user.enabled = enabled;
        true
    }

    /// 用户操作或续录窗口过期时 Error -> Idle
    pub fn give_up(&mut self) {
        if self.state.phase == Phase::Error {
            self.state.phase = Phase::Idle;
        }
    }

    fn invalid(&self, action: &'static str) -> EngineError {
        EngineError::InvalidState {
            handle: self.state.user.handle.clone(),
            phase: self.state.phase,
            action,
        }
    }
}
