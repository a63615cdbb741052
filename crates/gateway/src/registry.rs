// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Start/stop orchestration for the long-lived subsystem tasks.
//!
//! Tasks register in startup order and stop in reverse. Each task receives
//! its own cancellation token so shutdown can be staged; `stop_all` cancels
//! and joins one task at a time with a per-task timeout.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Entry {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    entries: Vec<Entry>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named task. The factory receives the task's own cancellation
    /// token.
    pub fn spawn<F, Fut>(&mut self, name: &str, factory: F) -> CancellationToken
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(factory(cancel.clone()));
        info!(task = name, "subsystem task started");
        self.entries.push(Entry { name: name.to_owned(), cancel: cancel.clone(), handle });
        cancel
    }

    pub fn task_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Cancel and join every task in reverse start order.
    pub async fn stop_all(&mut self) {
        for entry in self.entries.drain(..).rev() {
            entry.cancel.cancel();
            match tokio::time::timeout(STOP_TIMEOUT, entry.handle).await {
                Ok(Ok(())) => info!(task = %entry.name, "subsystem task stopped"),
                Ok(Err(e)) => warn!(task = %entry.name, "subsystem task panicked: {e}"),
                Err(_) => warn!(task = %entry.name, "subsystem task did not stop in time"),
            }
        }
    }

    /// Stop one named task ahead of the rest (staged shutdown).
    pub async fn stop(&mut self, name: &str) {
        let Some(position) = self.entries.iter().position(|e| e.name == name) else {
            return;
        };
        let entry = self.entries.remove(position);
        entry.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, entry.handle).await {
            Ok(Ok(())) => info!(task = %entry.name, "subsystem task stopped"),
            Ok(Err(e)) => warn!(task = %entry.name, "subsystem task panicked: {e}"),
            Err(_) => warn!(task = %entry.name, "subsystem task did not stop in time"),
        }
    }
}
