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

//! One IMAP connection: byte framing in, responses out.
//!
//! The loop here reads lines and literals, hands complete commands to
//! the session scheduler, relays reserved input to whichever command
//! claimed the stream, and multiplexes the timers the session asks for
//! (rate-limit holds, fetch trickle, NAT keepalive, inactivity).

use std::net::SocketAddr;
use std::rc::Rc;

use log::{info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::parser::{ends_with_literal, MAX_LINE};
use super::session::{Session, SessionCore, SessionState};
use crate::db::{Pool, Query, Value};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::proxy;
use crate::support::system_config::SystemConfig;

pub trait Io: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Io for T {}

/// Runs one IMAP connection to completion.
pub async fn run(
    mut io: Box<dyn Io>,
    pool: Pool,
    config: Rc<SystemConfig>,
    log_prefix: LogPrefix,
    shutting_down: Rc<std::cell::Cell<bool>>,
) -> Result<(), Error> {
    let (waker, mut woken) = mpsc::unbounded_channel();
    let mut core = SessionCore::new(
        pool.clone(),
        Rc::clone(&config),
        log_prefix,
        waker,
    );
    core.shutting_down = shutting_down.get();

    let mut greeting = format!(
        "* OK [CAPABILITY {}] {} Archiveopteryx IMAP Server",
        core.capability_string(),
        config.hostname,
    );
    if !config.security {
        greeting.push_str(" (security checking disabled)");
    }
    core.enqueue_line(&greeting);

    let mut session = Session::new(core);
    let mut mailbox_events = pool.listen("mailboxes_updated");

    let mut inbuf = Vec::<u8>::new();
    let mut cmdline = Vec::<u8>::new();
    let mut reading_literal: Option<u32> = None;
    let mut maybe_proxy = true;
    let mut peer: Option<SocketAddr> = None;
    let mut slf: Option<SocketAddr> = None;
    let mut bytes_before_login = 0usize;
    let mut poll: Option<Query> = None;
    let mut last_activity = Instant::now();
    let mut chunk = [0u8; 4096];

    loop {
        session.core.shutting_down |= shutting_down.get();
        session.run_commands();
        session.emit_responses();
        harvest_poll(&mut session, &mut poll);

        if !session.core.out.is_empty() {
            let out = std::mem::take(&mut session.core.out);
            io.write_all(&out).await?;
            io.flush().await?;
        }

        if session.core.closing {
            break;
        }

        let idle_deadline = last_activity + session.timeout();
        let scheduler_wake = session
            .core
            .wake_after
            .take()
            .map(|d| Instant::now() + d);
        let keepalive_wake = session
            .keepalive_due_in()
            .map(|d| Instant::now() + d);
        let mut deadline = idle_deadline;
        for candidate in [scheduler_wake, keepalive_wake].iter().flatten() {
            deadline = deadline.min(*candidate);
        }

        tokio::select! {
            read = io.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    info!(
                        "{} Unexpected close by client",
                        session.core.log_prefix,
                    );
                    session.fail_all("Unexpected close by client");
                    session.run_commands();
                    return Ok(());
                }
                last_activity = Instant::now();
                session.core.shutting_down |= shutting_down.get();
                inbuf.extend_from_slice(&chunk[..n]);

                if session.core.state == SessionState::NotAuthenticated {
                    bytes_before_login += n;
                    if bytes_before_login > 32768 {
                        info!(
                            "{} >32k received before login",
                            session.core.log_prefix,
                        );
                        session
                            .core
                            .enqueue_line("* BYE overlong login sequence");
                        session.core.closing = true;
                        continue;
                    }
                }

                if let Err(response) = drain_input(
                    &mut session,
                    &mut inbuf,
                    &mut cmdline,
                    &mut reading_literal,
                    &mut maybe_proxy,
                    &mut peer,
                    &mut slf,
                ) {
                    session.core.enqueue_line(&response);
                    session.core.closing = true;
                }
            },

            _ = woken.recv() => {},

            _ = mailbox_events.recv() => {
                start_poll(&mut session, &mut poll);
            },

            _ = tokio::time::sleep_until(deadline) => {
                if Instant::now() >= idle_deadline {
                    if session.core.state != SessionState::Logout {
                        info!("{} Idle timeout", session.core.log_prefix);
                        session.core.enqueue_line("* BYE Tempus fugit");
                    }
                    session.fail_all("Unexpected close by client");
                    session.core.closing = true;
                } else if keepalive_wake
                    .is_some_and(|k| Instant::now() >= k)
                {
                    session.defeat_nat();
                }
                // A scheduler wake needs nothing beyond another pass.
            },
        }
    }

    // Flush whatever the shutdown path queued.
    session.run_commands();
    session.emit_responses();
    if !session.core.out.is_empty() {
        let out = std::mem::take(&mut session.core.out);
        let _ = io.write_all(&out).await;
        let _ = io.flush().await;
    }

    Ok(())
}

/// Consumes as much buffered input as possible.
///
/// Returns `Err` with the response line to send when the connection must
/// be closed (over-long line).
#[allow(clippy::too_many_arguments)]
fn drain_input(
    session: &mut Session,
    inbuf: &mut Vec<u8>,
    cmdline: &mut Vec<u8>,
    reading_literal: &mut Option<u32>,
    maybe_proxy: &mut bool,
    peer: &mut Option<SocketAddr>,
    slf: &mut Option<SocketAddr>,
) -> Result<(), String> {
    loop {
        if *maybe_proxy {
            match proxy::decode(&session.core.log_prefix, inbuf) {
                proxy::Leader::Incomplete => return Ok(()),
                proxy::Leader::NotProxy => *maybe_proxy = false,
                proxy::Leader::Parsed { consumed, command } => {
                    inbuf.drain(..consumed);
                    *maybe_proxy = false;
                    if let proxy::Command::Proxy(p, s) = command {
                        info!(
                            "{} PROXY peer={p} self={s}",
                            session.core.log_prefix,
                        );
                        *peer = Some(p);
                        *slf = Some(s);
                    }
                },
            }
            continue;
        }

        if let Some(n) = *reading_literal {
            if inbuf.len() < n as usize {
                return Ok(());
            }
            cmdline.extend_from_slice(&inbuf[..n as usize]);
            inbuf.drain(..n as usize);
            *reading_literal = None;
            continue;
        }

        let Some(eol) = memchr::memchr(b'\n', inbuf) else {
            if inbuf.len() + cmdline.len() > MAX_LINE {
                return Err(
                    "500 Line too long (legal maximum is 998 bytes)"
                        .to_owned(),
                );
            }
            return Ok(());
        };

        let mut line_end = eol;
        if line_end > 0 && inbuf[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        if cmdline.len() + line_end > MAX_LINE {
            return Err(
                "500 Line too long (legal maximum is 998 bytes)".to_owned(),
            );
        }

        let line: Vec<u8> = inbuf[..line_end].to_vec();
        inbuf.drain(..eol + 1);

        if session.has_reserved_reader() {
            session.feed_reserved(&line);
            session.run_commands();
            continue;
        }

        cmdline.extend_from_slice(&line);

        if let Some((n, plus)) = ends_with_literal(cmdline) {
            if n <= session.core.config.literal_size_limit {
                cmdline.extend_from_slice(b"\r\n");
                *reading_literal = Some(n);
                if !plus {
                    session.core.enqueue_line("+ reading literal");
                }
                continue;
            }
            // Too large: never acknowledged, and the command line is
            // taken as it stands, which earns the client a BAD.
            warn!(
                "{} Rejecting {n} byte literal",
                session.core.log_prefix,
            );
        }

        let text = std::mem::take(cmdline);
        session.add_command(text);
        session.run_commands();
    }
}

/// Starts a poll of the selected mailbox after a change notification.
fn start_poll(session: &mut Session, poll: &mut Option<Query>) {
    if poll.is_some() {
        return;
    }
    let Some(mailbox_id) = session.core.mailbox.as_ref().map(|m| m.id)
    else {
        return;
    };
    let query = Query::new(
        "select uid, flags from mailbox_messages \
         where mailbox=$1 order by uid",
        vec![Value::Int(mailbox_id)],
    );
    session.core.execute(&query);
    *poll = Some(query);
}

/// Applies a finished poll: queues EXPUNGE for vanished messages and
/// EXISTS for new arrivals. The response sequencer decides when the
/// client actually hears about it.
fn harvest_poll(session: &mut Session, poll: &mut Option<Query>) {
    let Some(query) = poll.as_ref() else { return };
    if !query.done() {
        return;
    }
    let query = poll.take().unwrap();
    if query.failed() {
        return;
    }

    let Some(mailbox) = session.core.mailbox.as_ref() else { return };
    let mut current = Vec::new();
    while let Some(row) = query.next_row() {
        current.push(row.get_int("uid") as u32);
    }

    let vanished: Vec<u32> = mailbox
        .msns
        .iter()
        .copied()
        .filter(|u| !current.contains(u))
        .collect();
    let appeared: Vec<u32> = current
        .iter()
        .copied()
        .filter(|u| !mailbox.msns.contains(u))
        .collect();

    for uid in vanished {
        session
            .core
            .respond(super::response::ImapResponse::expunge(uid));
    }
    if !appeared.is_empty() {
        let total = {
            let mailbox = session.core.mailbox.as_mut().unwrap();
            mailbox.msns.extend(appeared);
            mailbox.msns.sort_unstable();
            mailbox.msns.len()
        };
        session
            .core
            .respond(super::response::ImapResponse::line(format!(
                "{total} EXISTS",
            )));
    }
    session.emit_responses();
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::rc::Rc;

    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    use super::*;
    use crate::db::testing::ScriptedBackend;
    use crate::db::{run_backend, Row};
    use crate::db_row;

    fn config() -> Rc<SystemConfig> {
        Rc::new(
            SystemConfig::load(
                "hostname = \"mail.example.com\"\n\
                 smart-host-address = \"127.0.0.1\"\n",
            )
            .unwrap(),
        )
    }

    fn user_rows() -> Vec<Row> {
        vec![db_row! { "id" => 3i64, "inbox" => 17i64 }]
    }

    fn mailbox_rows() -> Vec<Row> {
        vec![db_row! {
            "id" => 17i64,
            "uidvalidity" => 1i64,
            "uidnext" => 11i64,
            "nextmodseq" => 8i64,
        }]
    }

    fn message_list_rows() -> Vec<Row> {
        (1..=10)
            .map(|uid| {
                db_row! {
                    "uid" => uid as i64,
                    "flags" => if uid == 5 { "\\Seen" } else { "" },
                }
            })
            .collect()
    }

    fn trivia_rows() -> Vec<Row> {
        (1..=10)
            .map(|uid| {
                db_row! {
                    "uid" => uid as i64,
                    "flags" => "\\Seen",
                    "modseq" => 4i64,
                    "internaldate" => 1_700_000_000i64,
                    "rfc822size" => 128i64,
                }
            })
            .collect()
    }

    struct TestConnection {
        io: BufReader<DuplexStream>,
        shutdown: Rc<Cell<bool>>,
    }

    impl TestConnection {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            tokio::time::timeout(
                std::time::Duration::from_secs(10),
                self.io.read_line(&mut line),
            )
            .await
            .expect("timed out waiting for server output")
            .expect("server hung up");
            line.trim_end().to_owned()
        }

        async fn send(&mut self, text: &str) {
            self.io
                .get_mut()
                .write_all(text.as_bytes())
                .await
                .unwrap();
        }

        /// Reads lines until one starts with `prefix`, returning all of
        /// them.
        async fn until(&mut self, prefix: &str) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                let done = line.starts_with(prefix);
                lines.push(line);
                if done {
                    return lines;
                }
            }
        }
    }

    fn start_server(backend: ScriptedBackend) -> TestConnection {
        let (pool, rx) = Pool::new();
        tokio::task::spawn_local(run_backend(backend, rx));
        start_server_with_pool(pool)
    }

    fn start_server_with_pool(pool: Pool) -> TestConnection {
        let (client_io, server_io) = duplex(1 << 20);
        let shutdown = Rc::new(Cell::new(false));
        let server_shutdown = Rc::clone(&shutdown);
        tokio::task::spawn_local(async move {
            let _ = run(
                Box::new(server_io),
                pool,
                config(),
                LogPrefix::new("imap".to_owned(), 1),
                server_shutdown,
            )
            .await;
        });
        TestConnection {
            io: BufReader::new(client_io),
            shutdown,
        }
    }

    async fn login(conn: &mut TestConnection) {
        let greeting = conn.line().await;
        assert!(greeting.starts_with("* OK [CAPABILITY"));
        conn.send("A001 LOGIN nikita secret\r\n").await;
        let line = conn.line().await;
        assert!(line.starts_with("A001 OK"), "{line}");
    }

    async fn select_inbox(conn: &mut TestConnection) {
        conn.send("A002 SELECT INBOX\r\n").await;
        let lines = conn.until("A002 ").await;
        assert!(lines.iter().any(|l| l == "* 10 EXISTS"));
        assert!(lines.iter().any(|l| l.contains("[UIDVALIDITY 1]")));
        assert!(lines.iter().any(|l| l.contains("[UIDNEXT 11]")));
        assert!(lines.last().unwrap().starts_with("A002 OK [READ-WRITE]"));
    }

    fn full_backend() -> ScriptedBackend {
        ScriptedBackend::new()
            .on("from users", user_rows())
            .on("from mailboxes where name", mailbox_rows())
            .on("select uid, flags from mailbox_messages", message_list_rows())
            .on("rfc822size from mailbox_messages", trivia_rows())
    }

    #[test]
    fn login_select_fetch_logout() {
        run_login_select_fetch_logout();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_login_select_fetch_logout() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                login(&mut conn).await;
                select_inbox(&mut conn).await;

                conn.send("A003 FETCH 1:3 (FLAGS UID)\r\n").await;
                let lines = conn.until("A003 ").await;
                assert!(lines
                    .iter()
                    .any(|l| l.starts_with("* 1 FETCH (FLAGS (\\Seen) UID 1")));
                assert!(lines
                    .iter()
                    .any(|l| l.starts_with("* 3 FETCH (FLAGS (\\Seen) UID 3")));
                assert!(lines.last().unwrap().starts_with("A003 OK"));

                conn.send("A004 LOGOUT\r\n").await;
                let lines = conn.until("A004 ").await;
                assert!(lines.iter().any(|l| l.starts_with("* BYE")));
            })
            .await;
    }

    #[test]
    fn literal_plus_login_sends_no_continuation() {
        run_literal_plus();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_literal_plus() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend = ScriptedBackend::new().on_fn(
                    "from users",
                    |stmt| {
                        assert_eq!(
                            Value::Text("u".to_owned()),
                            stmt.params[0],
                        );
                        assert_eq!(
                            Value::Text("secr".to_owned()),
                            stmt.params[1],
                        );
                        Ok(user_rows())
                    },
                );
                let mut conn = start_server(backend);
                let _greeting = conn.line().await;

                conn.send("A001 LOGIN {1+}\r\nu {4+}\r\nsecr\r\n").await;
                // The next line from the server must be the tagged OK;
                // a "+ reading literal" here would be a protocol error.
                let line = conn.line().await;
                assert!(line.starts_with("A001 OK"), "{line}");
            })
            .await;
    }

    #[test]
    fn synchronising_literal_gets_continuation() {
        run_synchronising_literal();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_synchronising_literal() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                let _greeting = conn.line().await;

                conn.send("A001 LOGIN {6}\r\n").await;
                let line = conn.line().await;
                assert_eq!("+ reading literal", line);
                conn.send("nikita secret\r\n").await;
                let line = conn.line().await;
                assert!(line.starts_with("A001 OK"), "{line}");
            })
            .await;
    }

    #[test]
    fn overlong_line_closes_connection() {
        run_overlong_line();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_overlong_line() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(ScriptedBackend::new());
                let _greeting = conn.line().await;

                let big = "x".repeat(4097);
                conn.send(&big).await;
                let line = conn.line().await;
                assert_eq!(
                    "500 Line too long (legal maximum is 998 bytes)",
                    line,
                );

                // And the server hangs up.
                let mut rest = String::new();
                let n = conn.io.read_line(&mut rest).await.unwrap();
                assert_eq!(0, n);
            })
            .await;
    }

    #[test]
    fn bad_commands_are_rate_limited() {
        run_rate_limit();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_rate_limit() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                let _greeting = conn.line().await;

                for n in 1..=3 {
                    conn.send(&format!("A00{n} FROBNICATE\r\n")).await;
                    let line = conn.line().await;
                    assert!(line.contains("BAD"), "{line}");
                }

                let before = std::time::Instant::now();
                conn.send("A004 NOOP\r\n").await;
                let line = conn.line().await;
                assert!(line.starts_with("A004 OK"), "{line}");
                // min(16, 3) errors = roughly a three second hold.
                assert!(
                    before.elapsed() >= std::time::Duration::from_secs(2),
                    "command was not delayed: {:?}",
                    before.elapsed(),
                );
            })
            .await;
    }

    #[test]
    fn expunge_deferred_while_msn_command_runs() {
        run_expunge_gating();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_expunge_gating() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // While the MSN fetch is executing, message 5 is
                // expunged elsewhere: the fetch's own data query
                // triggers the change notification, so the expunge
                // becomes known while the command is still in flight.
                let (pool, backend_rx) = Pool::new();
                let notifier = pool.clone();
                let mut scans = 0u32;
                let backend = ScriptedBackend::new()
                    .on("from users", user_rows())
                    .on("from mailboxes where name", mailbox_rows())
                    .on_fn(
                        "select uid, flags from mailbox_messages",
                        move |_| {
                            scans += 1;
                            if scans == 1 {
                                Ok(message_list_rows())
                            } else {
                                Ok((1..=10)
                                    .filter(|&uid| uid != 5)
                                    .map(|uid| {
                                        db_row! {
                                            "uid" => uid as i64,
                                            "flags" => "",
                                        }
                                    })
                                    .collect())
                            }
                        },
                    )
                    .on_fn("rfc822size from mailbox_messages", move |_| {
                        notifier.notify("mailboxes_updated");
                        Ok(trivia_rows())
                    });
                tokio::task::spawn_local(run_backend(backend, backend_rx));
                let mut conn = start_server_with_pool(pool);

                login(&mut conn).await;
                select_inbox(&mut conn).await;

                conn.send("A003 FETCH 1:10 FLAGS\r\n").await;
                let lines = conn.until("A003 ").await;

                // Every FETCH response precedes the tagged OK, and the
                // expunge is deferred past the whole MSN-using command.
                let fetch_count = lines
                    .iter()
                    .filter(|l| l.contains(" FETCH ("))
                    .count();
                assert_eq!(10, fetch_count);
                assert!(
                    !lines.iter().any(|l| l.ends_with("EXPUNGE")),
                    "expunge emitted while an MSN command was in flight",
                );

                let line = conn.line().await;
                assert_eq!("* 5 EXPUNGE", line);
            })
            .await;
    }

    #[test]
    fn idle_lets_expunges_flow() {
        run_idle_expunge();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_idle_expunge() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // After the select, a mailboxes_updated notification
                // makes the server re-poll; message 5 is gone.
                let mut scans = 0u32;
                let backend = ScriptedBackend::new()
                    .on("from users", user_rows())
                    .on("from mailboxes where name", mailbox_rows())
                    .on_fn(
                        "select uid, flags from mailbox_messages",
                        move |_| {
                            scans += 1;
                            if scans == 1 {
                                Ok(message_list_rows())
                            } else {
                                Ok((1..=10)
                                    .filter(|&uid| uid != 5)
                                    .map(|uid| {
                                        db_row! {
                                            "uid" => uid as i64,
                                            "flags" => "",
                                        }
                                    })
                                    .collect())
                            }
                        },
                    );

                let (pool, rx) = Pool::new();
                tokio::task::spawn_local(run_backend(backend, rx));
                let mut conn = start_server_with_pool(pool.clone());

                login(&mut conn).await;
                select_inbox(&mut conn).await;

                conn.send("A003 IDLE\r\n").await;
                let line = conn.line().await;
                assert_eq!("+ idling", line);

                pool.notify("mailboxes_updated");

                let line = conn.line().await;
                assert_eq!("* 5 EXPUNGE", line);

                conn.send("DONE\r\n").await;
                let line = conn.line().await;
                assert!(line.starts_with("A003 OK"), "{line}");
            })
            .await;
    }

    #[test]
    fn pipelined_commands_answer_in_order() {
        run_pipelining();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_pipelining() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                login(&mut conn).await;
                select_inbox(&mut conn).await;

                // Two group-1 commands pipelined; tagged responses must
                // come back in receipt order.
                conn.send(
                    "A003 UID FETCH 1:2 FLAGS\r\nA004 UID FETCH 3:4 FLAGS\r\n",
                )
                .await;
                let lines = conn.until("A004 ").await;
                let a3 = lines
                    .iter()
                    .position(|l| l.starts_with("A003 OK"))
                    .expect("no A003 OK");
                let a4 = lines
                    .iter()
                    .position(|l| l.starts_with("A004 OK"))
                    .expect("no A004 OK");
                assert!(a3 < a4);
            })
            .await;
    }

    #[test]
    fn shutdown_rejects_new_commands() {
        run_shutdown_rejection();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_shutdown_rejection() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                login(&mut conn).await;

                conn.shutdown.set(true);
                conn.send("A002 NOOP\r\n").await;
                let lines = conn.until("A002 ").await;
                assert!(lines
                    .iter()
                    .any(|l| l.starts_with("* BYE")));
                assert!(lines.last().unwrap().starts_with(
                    "A002 NO May not be started during server shutdown",
                ));
            })
            .await;
    }

    #[test]
    fn proxy_leader_is_consumed() {
        run_proxy_leader();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_proxy_leader() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                let _greeting = conn.line().await;

                let leader = proxy::encode(
                    "192.0.2.1:40000".parse().unwrap(),
                    "192.0.2.9:143".parse().unwrap(),
                );
                conn.io.get_mut().write_all(&leader).await.unwrap();
                conn.send("A001 LOGIN nikita secret\r\n").await;
                let line = conn.line().await;
                assert!(line.starts_with("A001 OK"), "{line}");
            })
            .await;
    }

    #[test]
    fn unknown_command_hint() {
        run_unknown_command();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_unknown_command() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                let _greeting = conn.line().await;

                conn.send("A001 FROBNICATE\r\n").await;
                let line = conn.line().await;
                assert_eq!("A001 BAD No such command: frobnicate", line);

                // A known command where the tag should be gets the hint.
                conn.send("NOOP BADCMD\r\n").await;
                let lines = conn.until("NOOP BAD").await;
                assert!(lines[0].starts_with("* OK  Hint"));
            })
            .await;
    }

    #[test]
    fn condstore_changedsince_filters_fetch() {
        run_condstore_fetch();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_condstore_fetch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend = full_backend().on(
                    "for update",
                    vec![db_row! { "uid" => 7i64 }],
                );
                let log = backend.log();
                let mut conn = start_server(backend);
                login(&mut conn).await;
                select_inbox(&mut conn).await;

                conn.send("A003 UID FETCH 1:10 (FLAGS) (CHANGEDSINCE 3)\r\n")
                    .await;
                let lines = conn.until("A003 ").await;
                let fetches: Vec<&String> = lines
                    .iter()
                    .filter(|l| l.contains(" FETCH ("))
                    .collect();
                assert_eq!(1, fetches.len());
                assert!(fetches[0].contains("UID 7"));
                assert!(fetches[0].contains("MODSEQ (4)"));
                assert!(lines.last().unwrap().starts_with("A003 OK"));

                // The filter ran under a transaction which was
                // committed.
                let log = log.borrow();
                let begin =
                    log.iter().position(|s| s == "BEGIN").expect("no BEGIN");
                let commit = log
                    .iter()
                    .position(|s| s == "COMMIT")
                    .expect("no COMMIT");
                assert!(begin < commit);
            })
            .await;
    }

    #[test]
    fn store_emits_fetch_responses() {
        run_store();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_store() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend = ScriptedBackend::new()
                    .on("from users", user_rows())
                    .on("from mailboxes where name", mailbox_rows())
                    .on(
                        "select uid, flags from mailbox_messages",
                        message_list_rows(),
                    )
                    .on(
                        "select uid, flags, modseq from mailbox_messages",
                        vec![db_row! {
                            "uid" => 2i64,
                            "flags" => "",
                            "modseq" => 4i64,
                        }],
                    );
                let mut conn = start_server(backend);
                login(&mut conn).await;
                select_inbox(&mut conn).await;

                conn.send("A003 STORE 2 +FLAGS (\\Deleted)\r\n").await;
                let lines = conn.until("A003 ").await;
                assert!(lines
                    .iter()
                    .any(|l| l.contains("FETCH (FLAGS (\\Deleted)")));
                assert!(lines.last().unwrap().starts_with("A003 OK"));
            })
            .await;
    }

    #[test]
    fn quit_means_logout() {
        run_quit();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_quit() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut conn = start_server(full_backend());
                let _greeting = conn.line().await;

                conn.send("quit\r\n").await;
                let lines = conn.until("arnt ").await;
                assert!(lines.iter().any(|l| l.starts_with("* BYE")));
                assert!(lines.last().unwrap().starts_with("arnt OK"));
            })
            .await;
    }
}
