//-
// Copyright (c) 2024, The Archiveopteryx Developers
//
// This file is part of Archiveopteryx.
//
// Archiveopteryx is free software: you can redistribute it and/or modify it
// under the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Archiveopteryx is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
// or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Archiveopteryx. If not, see <http://www.gnu.org/licenses/>.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, error};
use tokio::sync::mpsc;

use super::{Query, Row, Statement};

/// A waker: the channel a session or agent listens on to learn that one of
/// its queries has completed.
pub type Waker = mpsc::UnboundedSender<()>;

/// Executes statements against the actual store.
///
/// The worker task calls this sequentially, so implementations need no
/// internal locking. `begin`/`commit`/`rollback` frame transactions; every
/// statement between `begin` and the matching end belongs to that
/// transaction.
pub trait Backend {
    fn execute(&mut self, stmt: &Statement) -> Result<Vec<Row>, String>;

    fn begin(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn rollback(&mut self) {}
}

pub(crate) enum Request {
    Query { query: Query, waker: Waker },
    Begin,
    TxQuery { query: Query, waker: Waker },
    Commit { tx: Transaction, waker: Waker },
    Rollback,
}

/// A clonable handle on the store.
///
/// All clones feed the same backend worker; the worker answers requests in
/// submission order, which also serialises transactions: between a
/// transaction's `execute()` and its `commit()`, no other submission is
/// processed, giving `SELECT ... FOR UPDATE` its exclusion.
#[derive(Clone)]
pub struct Pool {
    requests: mpsc::UnboundedSender<Request>,
    channels: Rc<RefCell<HashMap<String, Vec<mpsc::UnboundedSender<()>>>>>,
}

impl Pool {
    /// Creates a pool and the request stream its backend worker consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Pool {
                requests: tx,
                channels: Rc::new(RefCell::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Submits `query` for standalone execution. `waker` is pinged when the
    /// query completes.
    pub fn execute(&self, query: &Query, waker: Waker) {
        if self
            .requests
            .send(Request::Query {
                query: query.clone(),
                waker,
            })
            .is_err()
        {
            query.complete(Err("database worker is gone".to_owned()));
        }
    }

    /// Starts a transaction. Nothing reaches the backend until the
    /// transaction's `execute()` is called.
    pub fn transaction(&self) -> Transaction {
        Transaction {
            pool: self.clone(),
            state: Rc::new(RefCell::new(TxState::default())),
        }
    }

    /// Subscribes to an asynchronous notification channel, e.g.
    /// `deliveries_updated`.
    pub fn listen(&self, channel: &str) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .borrow_mut()
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    /// Raises a notification on `channel`.
    pub fn notify(&self, channel: &str) {
        if let Some(listeners) = self.channels.borrow().get(channel) {
            for listener in listeners {
                let _ = listener.send(());
            }
        }
    }

    fn send(&self, request: Request) -> bool {
        self.requests.send(request).is_ok()
    }
}

#[derive(Default)]
struct TxState {
    enqueued: Vec<Query>,
    started: bool,
    committed: bool,
    done: bool,
    error: Option<String>,
}

/// A transaction under construction and then in flight.
///
/// Queries are gathered with `enqueue()` and flushed to the backend with
/// `execute()`; `commit()` (or `rollback()`) ends the transaction. `done()`
/// and `failed()` report the final state once the backend has processed
/// the commit.
#[derive(Clone)]
pub struct Transaction {
    pool: Pool,
    state: Rc<RefCell<TxState>>,
}

impl Transaction {
    pub fn enqueue(&self, query: &Query) {
        self.state.borrow_mut().enqueued.push(query.clone());
    }

    /// Sends all enqueued queries to the backend, opening the transaction
    /// if this is the first batch.
    pub fn execute(&self, waker: &Waker) {
        let (first, queries) = {
            let mut state = self.state.borrow_mut();
            let first = !state.started;
            state.started = true;
            (first, std::mem::take(&mut state.enqueued))
        };

        if first && !self.pool.send(Request::Begin) {
            self.fail_queries(&queries, "database worker is gone");
            return;
        }

        for query in queries {
            if !self.pool.send(Request::TxQuery {
                query: query.clone(),
                waker: waker.clone(),
            }) {
                query.complete(Err("database worker is gone".to_owned()));
            }
        }
    }

    /// Commits. Any still-enqueued queries are flushed first.
    pub fn commit(&self, waker: &Waker) {
        self.execute(waker);
        {
            let mut state = self.state.borrow_mut();
            if state.committed {
                return;
            }
            state.committed = true;
        }

        if !self.pool.send(Request::Commit {
            tx: self.clone(),
            waker: waker.clone(),
        }) {
            let mut state = self.state.borrow_mut();
            state.done = true;
            state.error = Some("database worker is gone".to_owned());
        }
    }

    pub fn rollback(&self) {
        let started = {
            let mut state = self.state.borrow_mut();
            if state.committed {
                return;
            }
            state.committed = true;
            state.done = true;
            state.started
        };
        if started {
            let _ = self.pool.send(Request::Rollback);
        }
    }

    pub fn done(&self) -> bool {
        self.state.borrow().done
    }

    pub fn failed(&self) -> bool {
        self.state.borrow().error.is_some()
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    fn fail_queries(&self, queries: &[Query], error: &str) {
        for query in queries {
            query.complete(Err(error.to_owned()));
        }
        let mut state = self.state.borrow_mut();
        state.done = true;
        state.error = Some(error.to_owned());
    }

    pub(crate) fn complete_commit(&self, result: Result<(), String>) {
        let mut state = self.state.borrow_mut();
        state.done = true;
        if let Err(e) = result {
            state.error = Some(e);
        }
    }
}

/// The backend worker. Spawn this on the local set; it runs until every
/// `Pool` clone has been dropped.
pub async fn run_backend(
    mut backend: impl Backend,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    let mut in_transaction = false;
    let mut tx_failed = false;

    while let Some(request) = requests.recv().await {
        match request {
            Request::Query { query, waker } => {
                let result = backend.execute(query.statement());
                if let Err(ref e) = result {
                    debug!("query failed: {e}");
                }
                query.complete(result);
                let _ = waker.send(());
            },

            Request::Begin => {
                if in_transaction {
                    error!("BUG: nested transaction request");
                }
                in_transaction = true;
                tx_failed = backend.begin().is_err();
            },

            Request::TxQuery { query, waker } => {
                let result = if tx_failed {
                    Err("transaction already failed".to_owned())
                } else {
                    backend.execute(query.statement())
                };
                if let Err(ref e) = result {
                    debug!("query failed: {e}");
                    tx_failed = true;
                }
                query.complete(result);
                let _ = waker.send(());
            },

            Request::Commit { tx, waker } => {
                let result = if tx_failed {
                    backend.rollback();
                    Err("transaction already failed".to_owned())
                } else {
                    backend.commit()
                };
                tx.complete_commit(result);
                in_transaction = false;
                tx_failed = false;
                let _ = waker.send(());
            },

            Request::Rollback => {
                backend.rollback();
                in_transaction = false;
                tx_failed = false;
            },
        }

        // Cooperative fairness: let the issuer observe completion before
        // the next request is processed.
        tokio::task::yield_now().await;
    }
}
