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

//! Scripted backends for driving the protocol engines in tests.

use std::cell::RefCell;
use std::rc::Rc;

use super::{Backend, Row, Statement};

type Handler = Box<dyn FnMut(&Statement) -> Result<Vec<Row>, String>>;

/// A backend which answers statements by the first matching SQL fragment.
///
/// Statements nothing matches return no rows, so incidental UPDATEs don't
/// need scripting. The log of executed statements and transaction
/// boundaries can be inspected after the fact.
pub struct ScriptedBackend {
    handlers: Vec<(String, Handler)>,
    log: Rc<RefCell<Vec<String>>>,
    fail_commit: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        ScriptedBackend {
            handlers: Vec::new(),
            log: Rc::new(RefCell::new(Vec::new())),
            fail_commit: false,
        }
    }

    /// Answers any statement whose SQL contains `fragment` with `rows`,
    /// every time it is asked.
    pub fn on(mut self, fragment: &str, rows: Vec<Row>) -> Self {
        self.handlers.push((
            fragment.to_owned(),
            Box::new(move |_| Ok(rows.clone())),
        ));
        self
    }

    /// Answers with a closure, e.g. to assert on binds.
    pub fn on_fn(
        mut self,
        fragment: &str,
        f: impl FnMut(&Statement) -> Result<Vec<Row>, String> + 'static,
    ) -> Self {
        self.handlers.push((fragment.to_owned(), Box::new(f)));
        self
    }

    /// Makes every commit fail, for exercising the kill-switch paths.
    pub fn failing_commits(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    /// A shared view of the statement log. Entries are the raw SQL, plus
    /// the pseudo-statements "BEGIN", "COMMIT", and "ROLLBACK".
    pub fn log(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.log)
    }
}

impl Backend for ScriptedBackend {
    fn execute(&mut self, stmt: &Statement) -> Result<Vec<Row>, String> {
        self.log.borrow_mut().push(stmt.sql.clone());
        for &mut (ref fragment, ref mut handler) in &mut self.handlers {
            if stmt.sql.contains(&**fragment) {
                return handler(stmt);
            }
        }
        Ok(Vec::new())
    }

    fn begin(&mut self) -> Result<(), String> {
        self.log.borrow_mut().push("BEGIN".to_owned());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), String> {
        self.log.borrow_mut().push("COMMIT".to_owned());
        if self.fail_commit {
            Err("deadlock detected".to_owned())
        } else {
            Ok(())
        }
    }

    fn rollback(&mut self) {
        self.log.borrow_mut().push("ROLLBACK".to_owned());
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::super::{Pool, Query, Value};
    use super::*;
    use crate::db_row;

    #[test]
    fn plain_query_completes() {
        run_plain_query();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_plain_query() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend = ScriptedBackend::new().on(
                    "select id from users",
                    vec![db_row! { "id" => 42i64 }],
                );
                let (pool, rx) = Pool::new();
                tokio::task::spawn_local(super::super::run_backend(
                    backend, rx,
                ));

                let (waker, mut woken) = mpsc::unbounded_channel();
                let query =
                    Query::new("select id from users where login=$1", vec![
                        Value::from("nikita"),
                    ]);
                pool.execute(&query, waker);
                woken.recv().await.unwrap();

                assert!(query.done());
                assert!(!query.failed());
                assert_eq!(42, query.next_row().unwrap().get_int("id"));
            })
            .await;
    }

    #[test]
    fn transaction_commit_and_failure() {
        run_transaction_commit_and_failure();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_transaction_commit_and_failure() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend = ScriptedBackend::new().failing_commits();
                let log = backend.log();
                let (pool, rx) = Pool::new();
                tokio::task::spawn_local(super::super::run_backend(
                    backend, rx,
                ));

                let (waker, mut woken) = mpsc::unbounded_channel();
                let tx = pool.transaction();
                let query = Query::new("update deliveries set tried_at=now()",
                    vec![]);
                tx.enqueue(&query);
                tx.commit(&waker);

                while !tx.done() {
                    woken.recv().await.unwrap();
                }

                assert!(query.done());
                assert!(tx.failed());
                assert_eq!(
                    vec![
                        "BEGIN".to_owned(),
                        "update deliveries set tried_at=now()".to_owned(),
                        "COMMIT".to_owned(),
                    ],
                    *log.borrow(),
                );
            })
            .await;
    }
}
