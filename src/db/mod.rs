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

//! The interface the protocol engines use to talk to the relational store.
//!
//! Queries and transactions are submitted to a backend worker task over a
//! channel and complete asynchronously; the issuer polls `Query::done()`
//! from its own cooperative step and is woken through the waker channel it
//! registered. This keeps every protocol step non-blocking: a command that
//! needs the store enqueues its query, returns, and is stepped again when
//! the results have arrived.
//!
//! The backend itself (connection handling, SQL execution) is pluggable
//! via the `Backend` trait; tests drive the engines with scripted backends.

mod pool;
pub mod postgres;

pub(crate) use pool::Request;
pub use pool::{run_backend, Backend, Pool, Transaction};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A bind value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
    Bool(bool),
    /// An integer array, as used for `= any($n)` binds.
    IntSet(Vec<i64>),
    Null,
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// One statement with its binds.
#[derive(Clone, Debug)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Statement {
            sql: sql.into(),
            params,
        }
    }
}

/// One result row, addressed by column name.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Rc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Rc<Vec<String>>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Row { columns, values }
    }

    fn value(&self, name: &str) -> &Value {
        let ix = self
            .columns
            .iter()
            .position(|c| c == name)
            .unwrap_or_else(|| panic!("no column {name:?} in row"));
        &self.values[ix]
    }

    pub fn is_null(&self, name: &str) -> bool {
        matches!(*self.value(name), Value::Null)
    }

    pub fn get_int(&self, name: &str) -> i64 {
        match *self.value(name) {
            Value::Int(v) => v,
            ref v => panic!("column {name:?} is not an integer: {v:?}"),
        }
    }

    pub fn get_text(&self, name: &str) -> &str {
        match *self.value(name) {
            Value::Text(ref v) => v,
            ref v => panic!("column {name:?} is not text: {v:?}"),
        }
    }

    pub fn get_bool(&self, name: &str) -> bool {
        match *self.value(name) {
            Value::Bool(v) => v,
            // Postgres-shaped stores routinely return NULL where the
            // expression could not be evaluated; callers treat that as
            // false after checking is_null() where it matters.
            Value::Null => false,
            ref v => panic!("column {name:?} is not boolean: {v:?}"),
        }
    }
}

#[derive(Debug, Default)]
struct QueryState {
    done: bool,
    error: Option<String>,
    rows: VecDeque<Row>,
}

/// A query in flight (or not yet submitted).
///
/// Cheaply clonable; clones observe the same results. A query is submitted
/// either directly through `Pool::execute` or as part of a `Transaction`,
/// after which `done()` flips once the backend has answered and the result
/// rows are consumed through `next_row()`.
#[derive(Clone)]
pub struct Query {
    statement: Statement,
    state: Rc<RefCell<QueryState>>,
}

impl Query {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Query {
            statement: Statement::new(sql, params),
            state: Rc::new(RefCell::new(QueryState::default())),
        }
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// True once the backend has answered, whether or not it succeeded.
    pub fn done(&self) -> bool {
        self.state.borrow().done
    }

    pub fn failed(&self) -> bool {
        self.state.borrow().error.is_some()
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn has_results(&self) -> bool {
        !self.state.borrow().rows.is_empty()
    }

    pub fn next_row(&self) -> Option<Row> {
        self.state.borrow_mut().rows.pop_front()
    }

    /// Number of rows not yet consumed.
    pub fn rows(&self) -> usize {
        self.state.borrow().rows.len()
    }

    pub(crate) fn complete(&self, result: Result<Vec<Row>, String>) {
        let mut state = self.state.borrow_mut();
        state.done = true;
        match result {
            Ok(rows) => state.rows.extend(rows),
            Err(e) => state.error = Some(e),
        }
    }
}

/// Builds a `Row` from `column => value` pairs; test backends use this to
/// script results.
#[cfg(test)]
#[macro_export]
macro_rules! db_row {
    ($($name:expr => $value:expr),* $(,)*) => {
        $crate::db::Row::new(
            std::rc::Rc::new(vec![$($name.to_owned()),*]),
            vec![$($crate::db::Value::from($value)),*],
        )
    };
}

#[cfg(test)]
pub mod testing;
