use crate::audit::AuditLog;
use crate::config::Action;
use crate::filter::RuleEngine;
use crate::mailbox::{
    MailError, MailResult, MailSession, NormalizedMessage, DEFAULT_QUERY, LABEL_INBOX, LABEL_SPAM,
};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The provider rejected our credentials; nothing more can be done in
    /// this pass.
    #[error("Mail session needs to be reauthorized: {0}")]
    Reauthorize(String),

    #[error("Failed to list messages: {0}")]
    Listing(MailError),

    #[error("Failed to write audit log: {0}")]
    Audit(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub dry_run: bool,
    pub query: String,
    pub limit: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            dry_run: true,
            query: DEFAULT_QUERY.to_string(),
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub dry_run: bool,
    pub listed: usize,
    pub processed: usize,
    pub failed: usize,
    pub actions: BTreeMap<&'static str, usize>,
    pub interrupted: bool,
    pub log_path: PathBuf,
}

impl BatchReport {
    pub fn count(&self, action: Action) -> usize {
        self.actions.get(action.as_str()).copied().unwrap_or(0)
    }
}

/// Runs one pass over the messages a query returns.
pub struct BatchProcessor<'a> {
    engine: &'a RuleEngine,
    log: &'a AuditLog,
    options: BatchOptions,
    cancel: Arc<AtomicBool>,
}

enum Outcome {
    Done(Action),
    Failed,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(engine: &'a RuleEngine, log: &'a AuditLog, options: BatchOptions) -> Self {
        BatchProcessor {
            engine,
            log,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Checked between messages; once set the pass stops after the current one.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn audit(&self, text: &str) -> Result<(), BatchError> {
        self.log.append(text).map_err(BatchError::Audit)
    }

    pub fn run(&self, session: &mut dyn MailSession) -> Result<BatchReport, BatchError> {
        let mut report = BatchReport {
            dry_run: self.options.dry_run,
            log_path: self.log.path().to_path_buf(),
            ..Default::default()
        };

        log::info!(
            "Starting {} pass with query '{}'",
            if self.options.dry_run { "dry-run" } else { "apply" },
            self.options.query
        );

        let ids = match session.list_message_ids(&self.options.query) {
            Ok(ids) => ids,
            Err(e) => {
                self.audit(&format!("ERROR: Failed to list messages: {e}"))?;
                return Err(if e.is_auth() {
                    BatchError::Reauthorize(e.to_string())
                } else {
                    BatchError::Listing(e)
                });
            }
        };
        report.listed = ids.len();

        let limit = self.options.limit.unwrap_or(usize::MAX);
        for id in ids.iter().take(limit) {
            if self.cancel.load(Ordering::SeqCst) {
                report.interrupted = true;
                self.audit(&format!(
                    "INTERRUPTED: Stopped after {} of {} message(s)",
                    report.processed + report.failed,
                    report.listed
                ))?;
                break;
            }

            match self.process(session, id) {
                Ok(Outcome::Done(action)) => {
                    report.processed += 1;
                    *report.actions.entry(action.as_str()).or_insert(0) += 1;
                }
                Ok(Outcome::Failed) => report.failed += 1,
                Err(ProcessError::Auth(e)) => {
                    self.audit(&format!(
                        "ERROR: Authorization failed on message {id}, aborting pass: {e}"
                    ))?;
                    return Err(BatchError::Reauthorize(e.to_string()));
                }
                Err(ProcessError::Audit(e)) => return Err(BatchError::Audit(e)),
            }
        }

        log::info!(
            "Pass finished: {} processed, {} failed, {} listed",
            report.processed,
            report.failed,
            report.listed
        );
        Ok(report)
    }

    /// Handle one message. Provider errors other than auth failures are logged
    /// and reported as `Failed`; an `Err` is an auth failure or a broken log.
    fn process(&self, session: &mut dyn MailSession, id: &str) -> Result<Outcome, ProcessError> {
        let headers = match session.get_headers(id) {
            Ok(headers) => headers,
            Err(e) if e.is_auth() => return Err(ProcessError::Auth(e)),
            Err(e) => {
                log::warn!("Failed to fetch message {id}: {e}");
                self.log
                    .append(&format!("ERROR: Failed to fetch message {id}: {e}"))
                    .map_err(ProcessError::Audit)?;
                return Ok(Outcome::Failed);
            }
        };
        let msg = NormalizedMessage::new(id, headers);

        let decision = self.engine.evaluate(&msg.from);
        let action = decision.action;

        if self.options.dry_run {
            self.log
                .append(&format!(
                    "DRY-RUN: Would {action} email from {} subject: {}",
                    msg.from, msg.subject
                ))
                .map_err(ProcessError::Audit)?;
            return Ok(Outcome::Done(action));
        }

        match apply_action(session, &msg.id, action) {
            Ok(()) => {
                self.log
                    .append(&format!(
                        "ACTION: {action} email from {} subject: {}",
                        msg.from, msg.subject
                    ))
                    .map_err(ProcessError::Audit)?;
                Ok(Outcome::Done(action))
            }
            Err(e) if e.is_auth() => Err(ProcessError::Auth(e)),
            Err(e) => {
                log::warn!("Failed to {action} message {id}: {e}");
                self.log
                    .append(&format!(
                        "ERROR: Failed to {action} message {id} from {}: {e}",
                        msg.from
                    ))
                    .map_err(ProcessError::Audit)?;
                Ok(Outcome::Failed)
            }
        }
    }
}

enum ProcessError {
    Auth(MailError),
    Audit(anyhow::Error),
}

/// Perform the provider operation an action stands for.
pub fn apply_action(session: &mut dyn MailSession, id: &str, action: Action) -> MailResult<()> {
    match action {
        Action::Delete => session.trash(id),
        Action::MoveToSpam => session.add_label(id, LABEL_SPAM),
        Action::Archive => session.remove_label(id, LABEL_INBOX),
        Action::Keep => Ok(()),
    }
}
