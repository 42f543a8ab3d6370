use chrono::{DateTime, Local};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Deadline presets offered next to a custom value, in minutes.
pub const PRESET_DEADLINE_MINUTES: [u32; 4] = [1, 10, 20, 30];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordingStateError {
    #[error("No device is connected")]
    NotConnected,

    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("No recording is in progress")]
    NotRecording,

    #[error("Start time was not set properly")]
    MissingStartTime,

    #[error("End time must be greater than the current elapsed time")]
    DeadlineNotAfterElapsed {
        deadline_seconds: u64,
        elapsed_seconds: u64,
    },

    #[error("Please enter a valid time in minutes")]
    InvalidMinutes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingStatus {
    #[default]
    Idle,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// No session; the timer should stop.
    Idle,
    Running { elapsed_seconds: u64 },
    /// The deadline was hit; elapsed is clamped to it.
    DeadlineReached { elapsed_seconds: u64 },
}

/// Wall-clock bounds of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration_seconds: u64,
}

/// The recording state machine: `Idle -> Recording -> Idle`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSession {
    status: RecordingStatus,
    started_at: Option<DateTime<Local>>,
    elapsed_seconds: u64,
    deadline_seconds: Option<u64>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    pub fn is_recording(&self) -> bool {
        self.status == RecordingStatus::Recording
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn deadline_seconds(&self) -> Option<u64> {
        self.deadline_seconds
    }

    pub fn start(&mut self, now: DateTime<Local>) -> Result<(), RecordingStateError> {
        if self.is_recording() {
            return Err(RecordingStateError::AlreadyRecording);
        }
        self.status = RecordingStatus::Recording;
        self.started_at = Some(now);
        self.elapsed_seconds = 0;
        Ok(())
    }

    /// Advance the elapsed counter by one second.
    pub fn tick(&mut self) -> Tick {
        if !self.is_recording() {
            return Tick::Idle;
        }
        self.elapsed_seconds += 1;
        match self.deadline_seconds {
            Some(deadline) if self.elapsed_seconds >= deadline => {
                self.elapsed_seconds = deadline;
                Tick::DeadlineReached {
                    elapsed_seconds: deadline,
                }
            }
            _ => Tick::Running {
                elapsed_seconds: self.elapsed_seconds,
            },
        }
    }

    /// Set or clear the auto-stop deadline. A deadline not past the current
    /// elapsed time is rejected and the previous one is kept.
    pub fn set_deadline(
        &mut self,
        minutes: Option<u32>,
    ) -> Result<Option<u64>, RecordingStateError> {
        let Some(minutes) = minutes else {
            self.deadline_seconds = None;
            return Ok(None);
        };
        let deadline_seconds = u64::from(minutes) * 60;
        if deadline_seconds <= self.elapsed_seconds {
            return Err(RecordingStateError::DeadlineNotAfterElapsed {
                deadline_seconds,
                elapsed_seconds: self.elapsed_seconds,
            });
        }
        self.deadline_seconds = Some(deadline_seconds);
        Ok(Some(deadline_seconds))
    }

    /// Leave the recording state. Always ends `Idle` when a session was
    /// active, even if its start time is missing.
    pub fn finish(&mut self, now: DateTime<Local>) -> Result<SessionTiming, RecordingStateError> {
        if !self.is_recording() {
            return Err(RecordingStateError::NotRecording);
        }
        let started_at = self.started_at.take();
        *self = Self::default();

        let started_at = started_at.ok_or(RecordingStateError::MissingStartTime)?;
        let millis = (now - started_at).num_milliseconds().max(0);
        Ok(SessionTiming {
            started_at,
            ended_at: now,
            duration_seconds: ((millis + 500) / 1000).unsigned_abs(),
        })
    }
}

/// Whether the periodic task should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

/// The once-per-period task driving [`RecordingSession::tick`].
#[derive(Debug)]
pub struct SessionTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionTimer {
    /// Run `on_tick` every `period`, starting one period from now.
    pub fn spawn<F, Fut>(period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    () = token.cancelled() => break,

                    _ = ticker.tick() => {
                        if on_tick().await == TickControl::Stop {
                            break;
                        }
                    }
                }
            }
            log::debug!("Session timer stopped");
        });
        Self { cancel, task }
    }

    /// Stop ticking. Safe to call from inside the tick callback.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("{n} {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

/// `"5 seconds"`, `"1 minute 1 second"`.
pub fn format_duration(seconds: u64) -> String {
    let minutes = seconds / 60;
    let rest = seconds % 60;
    if minutes == 0 {
        plural(rest, "second")
    } else {
        format!("{} {}", plural(minutes, "minute"), plural(rest, "second"))
    }
}

/// `MM:SS` for the elapsed / deadline display.
pub fn format_clock(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Parse a user-typed minute count, ignoring anything that is not a digit.
pub fn parse_custom_minutes(input: &str) -> Result<u32, RecordingStateError> {
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    match digits.parse::<u32>() {
        Ok(minutes) if minutes > 0 => Ok(minutes),
        _ => Err(RecordingStateError::InvalidMinutes),
    }
}
