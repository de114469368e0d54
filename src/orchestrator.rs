//! Batch registration
//!
//! Runs `total` independent signup attempts with at most `concurrency`
//! in flight. Each attempt owns its browser session and its address;
//! the only shared resource is the mailbox behind [`CodeSource`].

use crate::address::{AddressGenerator, generate_password};
use crate::config::Settings;
use crate::driver::{Credentials, DriverFactory, SessionArtifacts, SignupDriver};
use crate::error::{Error, FailureKind, Result};
use crate::retry::RetryPolicy;
use crate::store::{AccountRecord, AccountStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where verification codes come from.
#[async_trait]
pub trait CodeSource: Send + Sync {
    /// Wait for the code sent to exactly `recipient`.
    async fn await_code(
        &self,
        recipient: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStatus {
    Succeeded { path: PathBuf },
    Failed { kind: FailureKind, reason: String },
    Cancelled,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded { path } => write!(f, "saved to {}", path.display()),
            Self::Failed { kind, reason } => write!(f, "failed ({kind}): {reason}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub id: usize,
    /// Address of the last try; empty when the attempt never started.
    pub email: String,
    pub started_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub elapsed: Duration,
    pub tries: u32,
}

impl AttemptReport {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, AttemptStatus::Succeeded { .. })
    }
}

/// Every attempt of a batch, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub attempts: Vec<AttemptReport>,
}

impl BatchReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_success()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a.status, AttemptStatus::Failed { .. }))
            .count()
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Cancelled)
            .count()
    }

    #[must_use]
    pub fn meets_threshold(&self, min_success: usize) -> bool {
        self.succeeded() >= min_success
    }
}

pub struct Orchestrator<F, C> {
    factory: F,
    codes: C,
    store: AccountStore,
    generator: AddressGenerator,
    password_length: usize,
    email_wait_timeout: Duration,
    email_poll_interval: Duration,
    retry: RetryPolicy,
}

impl<F: DriverFactory, C: CodeSource> Orchestrator<F, C> {
    #[must_use]
    pub fn new(settings: &Settings, factory: F, codes: C, store: AccountStore) -> Self {
        Self {
            factory,
            codes,
            store,
            generator: AddressGenerator::new(settings.domains.clone(), settings.local_part_length),
            password_length: settings.password_length,
            email_wait_timeout: settings.email_wait_timeout,
            email_poll_interval: settings.email_poll_interval,
            retry: settings.retry,
        }
    }

    pub const fn code_source(&self) -> &C {
        &self.codes
    }

    /// Run `total` attempts, at most `concurrency` at a time.
    ///
    /// Cancelling `cancel` stops new attempts from starting and makes
    /// in-flight ones stop at their next wait.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a zero `total` or `concurrency`. A fatal
    /// attempt error (configuration, missing browser) stops the batch
    /// and is returned.
    pub async fn run_batch(
        &self,
        total: usize,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        if total == 0 {
            return Err(Error::Config("total must be greater than 0".into()));
        }
        if concurrency == 0 {
            return Err(Error::Config("concurrency must be greater than 0".into()));
        }
        let concurrency = concurrency.min(total);
        info!(
            "Registering {} accounts, {} at a time",
            total, concurrency
        );

        let run = cancel.child_token();
        let fatal: Mutex<Option<Error>> = Mutex::new(None);

        let mut attempts: Vec<AttemptReport> = stream::iter(1..=total)
            .map(|id| self.attempt(id, &run, &fatal))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        attempts.sort_by_key(|a| a.id);

        if let Some(e) = fatal.into_inner().ok().flatten() {
            return Err(e);
        }

        let report = BatchReport { attempts };
        info!(
            "Batch finished: {} succeeded, {} failed, {} cancelled",
            report.succeeded(),
            report.failed(),
            report.cancelled()
        );
        Ok(report)
    }

    async fn attempt(
        &self,
        id: usize,
        cancel: &CancellationToken,
        fatal: &Mutex<Option<Error>>,
    ) -> AttemptReport {
        let started_at = Utc::now();
        let started = Instant::now();

        if cancel.is_cancelled() {
            return AttemptReport {
                id,
                email: String::new(),
                started_at,
                status: AttemptStatus::Cancelled,
                elapsed: started.elapsed(),
                tries: 0,
            };
        }

        let current = Mutex::new(String::new());
        let (result, tries) = self
            .retry
            .run(cancel, |n| {
                let email = self.generator.generate();
                if let Ok(mut slot) = current.lock() {
                    slot.clone_from(&email);
                }
                self.try_once(id, n, email, cancel)
            })
            .await;
        let email = current.into_inner().unwrap_or_default();

        let status = match result {
            Ok(path) => {
                info!("[{}] Registered {}", id, email);
                AttemptStatus::Succeeded { path }
            }
            Err(Error::Cancelled) => {
                info!("[{}] Cancelled ({})", id, email);
                AttemptStatus::Cancelled
            }
            Err(e) => {
                match e.kind() {
                    FailureKind::Ui => error!(
                        "[{}] {} failed with a UI error, the signup flow may have changed: {}",
                        id, email, e
                    ),
                    _ => warn!("[{}] {} failed: {}", id, email, e),
                }
                let status = AttemptStatus::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                };
                if e.is_fatal() {
                    error!("[{}] Fatal error, stopping the batch: {}", id, e);
                    if let Ok(mut slot) = fatal.lock() {
                        slot.get_or_insert(e);
                    }
                    cancel.cancel();
                }
                status
            }
        };

        AttemptReport {
            id,
            email,
            started_at,
            status,
            elapsed: started.elapsed(),
            tries,
        }
    }

    async fn try_once(
        &self,
        id: usize,
        try_no: u32,
        email: String,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        info!("[{}] Try {} with {}", id, try_no, email);
        let credentials = Credentials {
            email,
            password: generate_password(self.password_length),
        };

        let mut driver = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            launched = self.factory.launch() => launched?,
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.drive(driver.as_mut(), &credentials) => result,
        };
        driver.close().await;
        let artifacts = outcome?;

        let record = AccountRecord {
            email: credentials.email,
            password: credentials.password,
            token: artifacts.token,
            cookie: artifacts.cookie,
            created_at: Utc::now(),
        };
        self.store.save(&record)
    }

    async fn drive(
        &self,
        driver: &mut dyn SignupDriver,
        credentials: &Credentials,
    ) -> Result<SessionArtifacts> {
        driver.submit_email(credentials).await?;
        driver.await_code_prompt().await?;
        let code = self
            .codes
            .await_code(
                &credentials.email,
                self.email_wait_timeout,
                self.email_poll_interval,
            )
            .await?;
        driver.submit_code(&code).await?;
        driver.extract_session().await
    }
}
