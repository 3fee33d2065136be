use crate::runtime::{CreateOpts, ImageInfo, Output, RegistryAuth};
use crate::{EngineError, Result};

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The operations the pool knows how to dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobType {
    PullImage,
    CreateContainer,
    StartContainer,
    StopContainer,
    BuildImage,
    CopyFiles,
    ExecCommand,
    InspectImage,
    RemoveContainer,
    WaitContainer,
}

impl JobType {
    /// Soft per-type deadline, overridable by the job's own timeout.
    pub fn default_timeout(&self) -> Duration {
        match self {
            JobType::PullImage => Duration::from_secs(30 * 60),
            JobType::BuildImage => Duration::from_secs(4 * 60 * 60),
            JobType::CreateContainer => Duration::from_secs(15),
            JobType::StartContainer | JobType::StopContainer | JobType::RemoveContainer => {
                Duration::from_secs(10)
            }
            JobType::CopyFiles | JobType::ExecCommand => Duration::from_secs(30),
            JobType::InspectImage => Duration::from_secs(10),
            JobType::WaitContainer => Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl AsRef<str> for JobType {
    fn as_ref(&self) -> &str {
        match self {
            JobType::PullImage => "pull-image",
            JobType::CreateContainer => "create-container",
            JobType::StartContainer => "start-container",
            JobType::StopContainer => "stop-container",
            JobType::BuildImage => "build-image",
            JobType::CopyFiles => "copy-files",
            JobType::ExecCommand => "exec-command",
            JobType::InspectImage => "inspect-image",
            JobType::RemoveContainer => "remove-container",
            JobType::WaitContainer => "wait-container",
        }
    }
}

/// Advisory scheduling hint. The default pool dispatches strict FIFO and
/// ignores it; it is carried so backends that understand priorities can use
/// it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Type-matched job input.
#[derive(Clone, Debug)]
pub enum Payload {
    PullImage {
        image: String,
        auth: Option<RegistryAuth>,
    },
    CreateContainer {
        opts: CreateOpts,
        auth: Option<RegistryAuth>,
    },
    StartContainer {
        id: String,
    },
    StopContainer {
        id: String,
        signal: Option<String>,
    },
    BuildImage {
        dockerfile: Vec<u8>,
        name: String,
    },
    CopyFiles {
        id: String,
        content: Vec<u8>,
        dest: PathBuf,
    },
    ExecCommand {
        id: String,
        cmd: String,
        prefix: String,
    },
    InspectImage {
        reference: String,
    },
    RemoveContainer {
        id: String,
    },
    WaitContainer {
        id: String,
    },
}

impl Payload {
    pub fn job_type(&self) -> JobType {
        match self {
            Payload::PullImage { .. } => JobType::PullImage,
            Payload::CreateContainer { .. } => JobType::CreateContainer,
            Payload::StartContainer { .. } => JobType::StartContainer,
            Payload::StopContainer { .. } => JobType::StopContainer,
            Payload::BuildImage { .. } => JobType::BuildImage,
            Payload::CopyFiles { .. } => JobType::CopyFiles,
            Payload::ExecCommand { .. } => JobType::ExecCommand,
            Payload::InspectImage { .. } => JobType::InspectImage,
            Payload::RemoveContainer { .. } => JobType::RemoveContainer,
            Payload::WaitContainer { .. } => JobType::WaitContainer,
        }
    }
}

/// One unit of work for the pool. The cancellation token and the optional
/// deadline together form the job's context; the dispatcher composes them
/// with the pool's own token and the type-scoped timeout.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub priority: Priority,
    pub payload: Payload,
    /// Cancelling this interrupts the job even while it is dispatching.
    pub cancel: CancellationToken,
    /// Overrides the type-scoped default deadline when set.
    pub timeout: Option<Duration>,
    pub submitted_at: Instant,
}

impl Job {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: payload.job_type(),
            priority: Priority::Normal,
            payload,
            cancel: CancellationToken::new(),
            timeout: None,
            submitted_at: Instant::now(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches the caller's cancellation context.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The deadline the dispatcher enforces for this job.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .map(|t| t.min(self.job_type.default_timeout()))
            .unwrap_or_else(|| self.job_type.default_timeout())
    }

    /// Checks that the payload variant matches the declared type - the
    /// protocol violation surfaced as `InvalidJobPayload`.
    pub fn validate(&self) -> Result<()> {
        if self.payload.job_type() != self.job_type {
            return Err(EngineError::InvalidJobPayload {
                job_type: self.job_type.as_ref().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// What a finished job produced.
#[derive(Debug)]
pub enum JobOutcome {
    Done,
    ImageId(String),
    ContainerId(String),
    ExitStatus(Option<i64>),
    Image(ImageInfo),
    Exec(Output<String>),
}

/// Completion record emitted on the pool's result channel.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: Uuid,
    pub job_type: JobType,
    pub worker_id: usize,
    pub result: Result<JobOutcome>,
    pub started: Instant,
    pub finished: Instant,
}

impl JobResult {
    pub fn duration(&self) -> Duration {
        self.finished.duration_since(self.started)
    }

    pub fn queue_time(&self, submitted_at: Instant) -> Duration {
        self.started.duration_since(submitted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_determines_job_type() {
        let job = Job::new(Payload::StartContainer { id: "abc".into() });
        assert_eq!(job.job_type, JobType::StartContainer);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let mut job = Job::new(Payload::StartContainer { id: "abc".into() });
        job.job_type = JobType::PullImage;
        let err = job.validate().unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::InvalidJobPayload { .. })
        ));
    }

    #[test]
    fn effective_timeout_is_clamped_by_type_default() {
        let job = Job::new(Payload::StartContainer { id: "abc".into() })
            .timeout(Duration::from_secs(3600));
        assert_eq!(job.effective_timeout(), Duration::from_secs(10));

        let job =
            Job::new(Payload::StartContainer { id: "abc".into() }).timeout(Duration::from_secs(2));
        assert_eq!(job.effective_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn priorities_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
