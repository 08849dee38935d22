use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::{ExtensionError, Result};
use crate::ports::PortKey;
use crate::util::{next_id, now_ms};

/// Awaitable outcome of one pending request.
#[derive(Debug)]
pub struct Completion<R> {
    id: String,
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Completion<R> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<R> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExtensionError::Rejected(format!("Request {} was dropped", self.id))),
        }
    }
}

pub struct Pending<P, R> {
    pub id: String,
    pub url: String,
    pub port: PortKey,
    pub payload: P,
    pub created_at: u64,
    waiters: Vec<oneshot::Sender<Result<R>>>,
}

impl<P, R: Clone> Pending<P, R> {
    fn waiter(&mut self) -> Completion<R> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        Completion { id: self.id.clone(), rx }
    }

    /// Fulfil every waiter with the same outcome. A waiter whose task has
    /// gone away is skipped.
    pub fn complete(self, outcome: Result<R>) -> usize {
        let mut delivered = 0;
        for waiter in self.waiters {
            if waiter.send(outcome.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// UI-facing view of a pending request.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestView<P> {
    pub id: String,
    pub url: String,
    pub request: P,
    pub created_at: u64,
}

/// Insertion-ordered pending requests of one kind.
pub struct RequestQueue<P, R> {
    entries: Vec<Pending<P, R>>,
}

impl<P, R> Default for RequestQueue<P, R> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<P: Clone, R: Clone> RequestQueue<P, R> {
    pub fn push(&mut self, url: &str, port: PortKey, payload: P) -> Completion<R> {
        let mut pending = Pending {
            id: next_id(),
            url: url.to_string(),
            port,
            payload,
            created_at: now_ms(),
            waiters: Vec::new(),
        };
        let completion = pending.waiter();
        self.entries.push(pending);
        completion
    }

    /// Attach another waiter to the request already pending for `url`.
    pub fn attach(&mut self, url: &str) -> Option<Completion<R>> {
        self.entries.iter_mut().find(|p| p.url == url).map(Pending::waiter)
    }

    pub fn get(&self, id: &str) -> Result<&Pending<P, R>> {
        self.entries
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ExtensionError::RequestNotFound(id.to_string()))
    }

    pub fn take(&mut self, id: &str) -> Result<Pending<P, R>> {
        let idx = self
            .entries
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ExtensionError::RequestNotFound(id.to_string()))?;
        Ok(self.entries.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn views(&self) -> Vec<RequestView<P>> {
        self.entries
            .iter()
            .map(|p| RequestView {
                id: p.id.clone(),
                url: p.url.clone(),
                request: p.payload.clone(),
                created_at: p.created_at,
            })
            .collect()
    }
}
