//! Issue worker.
//!
//! HTTP handlers submit deposits and withdrawals here instead of running
//! the retry loop in their own future. Each request runs in the worker's
//! `JoinSet`, so a caller that disconnects or times out does not cancel a
//! pending retry, and shutdown waits for every issuance to finish.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};

use super::issuer::{DepositReceipt, OfferIssuer, WithdrawalReceipt};
use crate::types::{DepositRequest, IssueError, WithdrawalRequest};

type Reply<T> = oneshot::Sender<Result<T, IssueError>>;

enum Job {
    Deposit {
        request: DepositRequest,
        reply: Reply<DepositReceipt>,
    },
    Withdraw {
        request: WithdrawalRequest,
        reply: Reply<WithdrawalReceipt>,
    },
}

/// Handle for submitting issuance requests to the worker.
#[derive(Clone)]
pub struct IssueQueue {
    tx: mpsc::Sender<Job>,
}

impl IssueQueue {
    /// Submit a deposit and wait for its terminal result.
    ///
    /// Dropping the returned future stops the wait, not the issuance.
    pub async fn deposit(&self, request: DepositRequest) -> Result<DepositReceipt, IssueError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Deposit { request, reply }).await?;
        rx.await.map_err(|_| IssueError::ShuttingDown)?
    }

    /// Submit a withdrawal and wait for its terminal result.
    pub async fn withdraw(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalReceipt, IssueError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Withdraw { request, reply }).await?;
        rx.await.map_err(|_| IssueError::ShuttingDown)?
    }

    async fn submit(&self, job: Job) -> Result<(), IssueError> {
        self.tx.send(job).await.map_err(|_| IssueError::ShuttingDown)
    }
}

pub struct IssueWorker {
    issuer: Arc<OfferIssuer>,
    rx: mpsc::Receiver<Job>,
    tasks: JoinSet<()>,
}

/// Create the queue handle and the worker that serves it.
pub fn issue_channel(issuer: Arc<OfferIssuer>, capacity: usize) -> (IssueQueue, IssueWorker) {
    let (tx, rx) = mpsc::channel(capacity);
    let worker = IssueWorker {
        issuer,
        rx,
        tasks: JoinSet::new(),
    };
    (IssueQueue { tx }, worker)
}

impl IssueWorker {
    /// Serve submissions until every queue handle is dropped, then wait for
    /// in-flight issuances.
    pub async fn run(mut self) {
        info!("Issue worker started");

        loop {
            let job = tokio::select! {
                job = self.rx.recv() => job,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_task_exit(joined);
                    continue;
                }
            };

            let Some(job) = job else {
                break;
            };
            self.spawn(job);
        }

        if !self.tasks.is_empty() {
            info!(count = self.tasks.len(), "Waiting for in-flight issuances");
        }
        while let Some(joined) = self.tasks.join_next().await {
            log_task_exit(joined);
        }
        info!("Issue worker stopped");
    }

    fn spawn(&mut self, job: Job) {
        let issuer = Arc::clone(&self.issuer);
        match job {
            Job::Deposit { request, reply } => {
                self.tasks.spawn(async move {
                    let participant = request.id.clone();
                    let result = issuer.deposit(request).await;
                    if reply.send(result).is_err() {
                        debug!(%participant, "Deposit caller gone before the result");
                    }
                });
            }
            Job::Withdraw { request, reply } => {
                self.tasks.spawn(async move {
                    let winner = request.winner.id.clone();
                    let result = issuer.withdraw(request).await;
                    if reply.send(result).is_err() {
                        debug!(%winner, "Withdrawal caller gone before the result");
                    }
                });
            }
        }
    }
}

fn log_task_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Issuance task panicked or was aborted");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
