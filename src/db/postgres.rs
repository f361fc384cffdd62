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

//! The production store worker: a small PostgreSQL frontend.
//!
//! This speaks the v3 wire protocol in its simple-query form over one
//! connection, which doubles as the LISTEN channel for the
//! `deliveries_updated` and `mailboxes_updated` signals. Binds are
//! rendered into the statement text as quoted literals before sending.
//!
//! Only trust and cleartext-password authentication are handled; anyone
//! running md5 or SCRAM should put the credentials in `pg_hba.conf`
//! terms this client understands.

use std::rc::Rc;

use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::pool::Request;
use super::{Pool, Row, Statement, Value};
use crate::support::error::Error;

pub struct PostgresConfig {
    pub address: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

/// Connects, authenticates, issues the LISTENs, and then serves pool
/// requests until every `Pool` clone is gone.
pub async fn run_postgres(
    config: PostgresConfig,
    pool: Pool,
    mut requests: mpsc::UnboundedReceiver<Request>,
) -> Result<(), Error> {
    let stream =
        TcpStream::connect((config.address.as_str(), config.port)).await?;
    let mut connection = Connection {
        stream,
        inbuf: Vec::new(),
        pool,
    };

    connection.startup(&config).await?;
    connection
        .simple_query("LISTEN deliveries_updated")
        .await
        .map_err(Error::Database)?;
    connection
        .simple_query("LISTEN mailboxes_updated")
        .await
        .map_err(Error::Database)?;
    info!("Connected to Postgres at {}:{}", config.address, config.port);

    enum Event {
        Request(Option<Request>),
        Backend(Message),
    }

    let mut tx_failed = false;
    loop {
        let event = tokio::select! {
            request = requests.recv() => Event::Request(request),
            message = connection.read_message() => {
                Event::Backend(message?)
            },
        };

        match event {
            Event::Request(None) => return Ok(()),

            Event::Request(Some(Request::Query { query, waker })) => {
                let result =
                    connection.execute_statement(query.statement()).await;
                query.complete(result);
                let _ = waker.send(());
            },

            Event::Request(Some(Request::Begin)) => {
                tx_failed =
                    connection.simple_query("BEGIN").await.is_err();
            },

            Event::Request(Some(Request::TxQuery { query, waker })) => {
                let result = if tx_failed {
                    Err("transaction already failed".to_owned())
                } else {
                    connection.execute_statement(query.statement()).await
                };
                if result.is_err() {
                    tx_failed = true;
                }
                query.complete(result);
                let _ = waker.send(());
            },

            Event::Request(Some(Request::Commit { tx, waker })) => {
                let result = if tx_failed {
                    let _ = connection.simple_query("ROLLBACK").await;
                    Err("transaction already failed".to_owned())
                } else {
                    connection.simple_query("COMMIT").await.map(|_| ())
                };
                tx.complete_commit(result);
                tx_failed = false;
                let _ = waker.send(());
            },

            Event::Request(Some(Request::Rollback)) => {
                let _ = connection.simple_query("ROLLBACK").await;
                tx_failed = false;
            },

            // Between queries the only backend traffic is asynchronous:
            // notifications and notices.
            Event::Backend(Message::Notification { channel }) => {
                connection.pool.notify(&channel);
            },
            Event::Backend(Message::Error(e)) => {
                error!("Postgres reported: {e}");
            },
            Event::Backend(_) => {},
        }
    }
}

struct Connection {
    stream: TcpStream,
    inbuf: Vec<u8>,
    pool: Pool,
}

enum Message {
    Authentication(u32),
    ReadyForQuery,
    RowDescription(Vec<(String, u32)>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete,
    Notification { channel: String },
    Error(String),
    Other,
}

impl Connection {
    async fn startup(&mut self, config: &PostgresConfig) -> Result<(), Error> {
        let mut body = Vec::<u8>::new();
        body.extend_from_slice(&196_608u32.to_be_bytes()); // protocol 3.0
        for (key, value) in [
            ("user", config.user.as_str()),
            ("database", config.database.as_str()),
        ] {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);

        let mut packet = Vec::with_capacity(body.len() + 4);
        packet.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        packet.extend_from_slice(&body);
        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;

        loop {
            match self.read_message().await? {
                Message::Authentication(0) => {},
                Message::Authentication(3) => {
                    let password =
                        config.password.as_deref().unwrap_or("");
                    self.send_message(b'p', password.as_bytes(), true)
                        .await?;
                },
                Message::Authentication(method) => {
                    return Err(Error::Database(format!(
                        "unsupported authentication method {method}",
                    )));
                },
                Message::ReadyForQuery => return Ok(()),
                Message::Error(e) => return Err(Error::Database(e)),
                _ => {},
            }
        }
    }

    async fn execute_statement(
        &mut self,
        statement: &Statement,
    ) -> Result<Vec<Row>, String> {
        let sql = interpolate(statement);
        debug!("executing: {sql}");
        self.simple_query(&sql).await
    }

    /// Sends one simple query and collects its result rows.
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<Row>, String> {
        self.send_message(b'Q', sql.as_bytes(), true)
            .await
            .map_err(|e| e.to_string())?;

        let mut columns: Rc<Vec<String>> = Rc::new(Vec::new());
        let mut types: Vec<u32> = Vec::new();
        let mut rows = Vec::new();
        let mut error = None;

        loop {
            match self.read_message().await.map_err(|e| e.to_string())? {
                Message::RowDescription(fields) => {
                    columns = Rc::new(
                        fields.iter().map(|&(ref n, _)| n.clone()).collect(),
                    );
                    types = fields.into_iter().map(|(_, t)| t).collect();
                },
                Message::DataRow(cells) => {
                    let values = cells
                        .into_iter()
                        .zip(&types)
                        .map(|(cell, &typoid)| decode_value(cell, typoid))
                        .collect();
                    rows.push(Row::new(Rc::clone(&columns), values));
                },
                Message::Notification { channel } => {
                    self.pool.notify(&channel);
                },
                Message::Error(e) => error = Some(e),
                Message::ReadyForQuery => break,
                Message::CommandComplete
                | Message::Authentication(_)
                | Message::Other => {},
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    async fn send_message(
        &mut self,
        tag: u8,
        body: &[u8],
        nul_terminate: bool,
    ) -> Result<(), Error> {
        let len = body.len() as u32 + 4 + u32::from(nul_terminate);
        let mut packet = Vec::with_capacity(body.len() + 6);
        packet.push(tag);
        packet.extend_from_slice(&len.to_be_bytes());
        packet.extend_from_slice(body);
        if nul_terminate {
            packet.push(0);
        }
        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Message, Error> {
        loop {
            if self.inbuf.len() >= 5 {
                let len = u32::from_be_bytes([
                    self.inbuf[1],
                    self.inbuf[2],
                    self.inbuf[3],
                    self.inbuf[4],
                ]) as usize;
                if self.inbuf.len() >= len + 1 {
                    let tag = self.inbuf[0];
                    let payload: Vec<u8> =
                        self.inbuf[5..len + 1].to_vec();
                    self.inbuf.drain(..len + 1);
                    return Ok(parse_message(tag, &payload));
                }
            }

            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::DatabaseUnavailable);
            }
            self.inbuf.extend_from_slice(&chunk[..n]);
        }
    }
}

fn parse_message(tag: u8, payload: &[u8]) -> Message {
    match tag {
        b'R' => {
            let code = payload
                .get(..4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(u32::MAX);
            Message::Authentication(code)
        },
        b'Z' => Message::ReadyForQuery,
        b'C' => Message::CommandComplete,
        b'T' => {
            let count = u16::from_be_bytes([payload[0], payload[1]]);
            let mut fields = Vec::with_capacity(count as usize);
            let mut pos = 2;
            for _ in 0..count {
                let end = payload[pos..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|ix| pos + ix)
                    .unwrap_or(payload.len());
                let name = String::from_utf8_lossy(&payload[pos..end])
                    .into_owned();
                pos = end + 1;
                // table oid (4), attnum (2), then the type oid.
                let typoid = payload
                    .get(pos + 6..pos + 10)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                pos += 18;
                fields.push((name, typoid));
            }
            Message::RowDescription(fields)
        },
        b'D' => {
            let count = u16::from_be_bytes([payload[0], payload[1]]);
            let mut cells = Vec::with_capacity(count as usize);
            let mut pos = 2;
            for _ in 0..count {
                let len = i32::from_be_bytes([
                    payload[pos],
                    payload[pos + 1],
                    payload[pos + 2],
                    payload[pos + 3],
                ]);
                pos += 4;
                if len < 0 {
                    cells.push(None);
                } else {
                    let len = len as usize;
                    cells.push(Some(payload[pos..pos + len].to_vec()));
                    pos += len;
                }
            }
            Message::DataRow(cells)
        },
        b'A' => {
            // pid, then the channel name.
            let channel_bytes = &payload[4..];
            let end = channel_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(channel_bytes.len());
            Message::Notification {
                channel: String::from_utf8_lossy(&channel_bytes[..end])
                    .into_owned(),
            }
        },
        b'E' => {
            // Concatenate the human-readable error fields.
            let mut text = String::new();
            for field in payload.split(|&b| b == 0) {
                if field.first() == Some(&b'M') {
                    text =
                        String::from_utf8_lossy(&field[1..]).into_owned();
                }
            }
            Message::Error(text)
        },
        _ => Message::Other,
    }
}

fn decode_value(cell: Option<Vec<u8>>, typoid: u32) -> Value {
    let Some(cell) = cell else { return Value::Null };
    let text = String::from_utf8_lossy(&cell).into_owned();
    match typoid {
        16 => Value::Bool(text == "t"),
        20 | 21 | 23 | 26 => {
            text.parse::<i64>().map(Value::Int).unwrap_or(Value::Null)
        },
        _ => Value::Text(text),
    }
}

/// Renders the statement's binds into the SQL text.
///
/// Higher-numbered placeholders are substituted first so `$1` never
/// clobbers the prefix of `$10`.
fn interpolate(statement: &Statement) -> String {
    let mut sql = statement.sql.clone();
    for (ix, value) in statement.params.iter().enumerate().rev() {
        let placeholder = format!("${}", ix + 1);
        sql = sql.replace(&placeholder, &render_literal(value));
    }
    sql
}

fn render_literal(value: &Value) -> String {
    match *value {
        Value::Int(v) => v.to_string(),
        Value::Bool(true) => "TRUE".to_owned(),
        Value::Bool(false) => "FALSE".to_owned(),
        Value::Null => "NULL".to_owned(),
        Value::Text(ref v) => format!("'{}'", v.replace('\'', "''")),
        Value::IntSet(ref vs) => {
            let items = vs
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",");
            format!("ARRAY[{items}]::bigint[]")
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literal_rendering() {
        assert_eq!("42", render_literal(&Value::Int(42)));
        assert_eq!("TRUE", render_literal(&Value::Bool(true)));
        assert_eq!("NULL", render_literal(&Value::Null));
        assert_eq!(
            "'it''s nice'",
            render_literal(&Value::Text("it's nice".to_owned())),
        );
        assert_eq!(
            "ARRAY[1,2,3]::bigint[]",
            render_literal(&Value::IntSet(vec![1, 2, 3])),
        );
    }

    #[test]
    fn interpolation_is_positional() {
        let statement = Statement::new(
            "select * from t where a=$1 and b=$2 and c=$1",
            vec![Value::Int(7), Value::Text("x".to_owned())],
        );
        assert_eq!(
            "select * from t where a=7 and b='x' and c=7",
            interpolate(&statement),
        );
    }

    #[test]
    fn interpolation_handles_ten_plus() {
        let params: Vec<Value> = (1..=10).map(Value::Int).collect();
        let statement =
            Statement::new("values ($1, $10, $2)", params);
        assert_eq!("values (1, 10, 2)", interpolate(&statement));
    }

    #[test]
    fn row_description_and_data_row_decode() {
        // Two columns: id (int8, oid 20) and name (text, oid 25).
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u16.to_be_bytes());
        for (name, oid) in [("id", 20u32), ("name", 25u32)] {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&0u32.to_be_bytes()); // table oid
            payload.extend_from_slice(&0u16.to_be_bytes()); // attnum
            payload.extend_from_slice(&oid.to_be_bytes());
            payload.extend_from_slice(&8u16.to_be_bytes()); // typlen
            payload.extend_from_slice(&0u32.to_be_bytes()); // typmod
            payload.extend_from_slice(&0u16.to_be_bytes()); // format
        }
        let Message::RowDescription(fields) = parse_message(b'T', &payload)
        else {
            panic!("not a row description");
        };
        assert_eq!(
            vec![("id".to_owned(), 20), ("name".to_owned(), 25)],
            fields,
        );

        let mut payload = Vec::new();
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&2i32.to_be_bytes());
        payload.extend_from_slice(b"42");
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        let Message::DataRow(cells) = parse_message(b'D', &payload) else {
            panic!("not a data row");
        };
        assert_eq!(
            vec![Some(b"42".to_vec()), None],
            cells,
        );
        assert_eq!(Value::Int(42), decode_value(cells[0].clone(), 20));
        assert_eq!(Value::Null, decode_value(cells[1].clone(), 25));
    }

    #[test]
    fn notification_and_error_decode() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1234u32.to_be_bytes());
        payload.extend_from_slice(b"deliveries_updated\0\0");
        let Message::Notification { channel } =
            parse_message(b'A', &payload)
        else {
            panic!("not a notification");
        };
        assert_eq!("deliveries_updated", channel);

        let payload = b"SERROR\0C42601\0Msyntax error\0\0".to_vec();
        let Message::Error(text) = parse_message(b'E', &payload) else {
            panic!("not an error");
        };
        assert_eq!("syntax error", text);
    }
}
