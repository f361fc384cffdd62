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

//! Per-connection IMAP state and the command scheduler.
//!
//! The scheduler keeps several client commands in flight at once when
//! their concurrency groups allow it, emits finished commands' responses
//! in receipt order, and slows down clients that keep sending garbage.

use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use chrono::prelude::*;
use log::{debug, info};
use tokio::sync::mpsc;

use super::command::{Command, State};
use super::parser::Parser;
use super::response::ImapResponse;
use crate::db::{Pool, Query, Transaction};
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

pub struct User {
    pub id: i64,
    pub login: String,
    pub has_inbox: bool,
}

pub struct SelectedMailbox {
    pub id: i64,
    pub name: String,
    pub read_only: bool,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub highestmodseq: u64,
    /// UIDs in MSN order: `msns[0]` is message 1.
    pub msns: Vec<u32>,
}

#[derive(Default)]
pub struct ClientBugs {
    /// The client sits behind an aggressive NAT and needs to see bytes
    /// now and then.
    pub nat: bool,
    /// The client mishandles unsolicited responses.
    pub no_unsolicited: bool,
}

#[derive(Default)]
pub struct ClientCaps {
    pub condstore: bool,
    pub qresync: bool,
}

/// Everything a command may touch while it runs. Split out from the
/// command queue itself so a command can be stepped with the rest of the
/// session borrowed alongside it.
pub struct SessionCore {
    pub state: SessionState,
    pub user: Option<User>,
    pub mailbox: Option<SelectedMailbox>,
    pub responses: Vec<ImapResponse>,
    pub out: Vec<u8>,
    pub pool: Pool,
    pub waker: mpsc::UnboundedSender<()>,
    pub config: Rc<SystemConfig>,
    pub log_prefix: LogPrefix,
    pub capabilities: ClientCaps,
    pub client_bugs: ClientBugs,
    pub syntax_errors: u32,
    pub last_bad_time: i64,
    pub next_ok_time: i64,
    pub shutting_down: bool,
    pub closing: bool,
    pub reader: Option<u64>,
    /// The earliest the scheduler wants to be woken, if at all.
    pub wake_after: Option<Duration>,
    #[cfg(test)]
    pub fake_now: Option<Rc<std::cell::Cell<i64>>>,
}

impl SessionCore {
    pub fn new(
        pool: Pool,
        config: Rc<SystemConfig>,
        log_prefix: LogPrefix,
        waker: mpsc::UnboundedSender<()>,
    ) -> Self {
        SessionCore {
            state: SessionState::NotAuthenticated,
            user: None,
            mailbox: None,
            responses: Vec::new(),
            out: Vec::new(),
            pool,
            waker,
            config,
            log_prefix,
            capabilities: ClientCaps::default(),
            client_bugs: ClientBugs::default(),
            syntax_errors: 0,
            last_bad_time: 0,
            next_ok_time: 0,
            shutting_down: false,
            closing: false,
            reader: None,
            wake_after: None,
            #[cfg(test)]
            fake_now: None,
        }
    }

    pub fn now(&self) -> i64 {
        #[cfg(test)]
        if let Some(ref fake) = self.fake_now {
            return fake.get();
        }
        Utc::now().timestamp()
    }

    pub fn execute(&self, query: &Query) {
        self.pool.execute(query, self.waker.clone());
    }

    pub fn transaction(&self) -> Transaction {
        self.pool.transaction()
    }

    pub fn enqueue_line(&mut self, line: &str) {
        self.out.extend_from_slice(line.as_bytes());
        self.out.extend_from_slice(b"\r\n");
    }

    pub fn respond(&mut self, response: ImapResponse) {
        self.responses.push(response);
    }

    pub fn record_syntax_error(&mut self) {
        self.syntax_errors += 1;
        self.last_bad_time = self.now();
    }

    pub fn reserve(&mut self, serial: u64) {
        self.reader = Some(serial);
    }

    pub fn release_reader(&mut self, serial: u64) {
        if self.reader == Some(serial) {
            self.reader = None;
        }
    }

    pub fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("{} Changed to {state:?} state", self.log_prefix);
            self.state = state;
        }
    }

    pub fn authenticated(&mut self, user: User, mechanism: &str) {
        info!(
            "{} Authenticated as {} using {mechanism}",
            self.log_prefix, user.login,
        );
        self.log_prefix.set_user(user.login.clone());
        self.user = Some(user);
        self.set_state(SessionState::Authenticated);
    }

    pub fn select_mailbox(&mut self, mailbox: SelectedMailbox) {
        self.mailbox = Some(mailbox);
        self.set_state(SessionState::Selected);
    }

    /// Leaves the Selected state, announcing the closure if a mailbox
    /// was open.
    pub fn deselect(&mut self) {
        if self.mailbox.take().is_some() {
            self.respond(ImapResponse::line("OK [CLOSED] I, missa est"));
            if self.state == SessionState::Selected {
                self.set_state(SessionState::Authenticated);
            }
        }
    }

    pub fn capability_string(&self) -> String {
        "IMAP4rev1 LITERAL+ IDLE ENABLE CONDSTORE QRESYNC UIDPLUS \
         AUTH=PLAIN"
            .to_owned()
    }

    pub fn request_wake(&mut self, after: Duration) {
        self.wake_after = Some(match self.wake_after {
            Some(current) => current.min(after),
            None => after,
        });
    }
}

pub struct Session {
    pub core: SessionCore,
    pub commands: VecDeque<Command>,
    running: bool,
    again: bool,
    next_serial: u64,
    nat_heuristic_done: bool,
    tags_look_natted: bool,
}

impl Session {
    pub fn new(core: SessionCore) -> Self {
        Session {
            core,
            commands: VecDeque::new(),
            running: false,
            again: false,
            next_serial: 0,
            nat_heuristic_done: false,
            tags_look_natted: true,
        }
    }

    /// True when the client is not waiting for us: no commands at all,
    /// or only an executing IDLE.
    pub fn idle(&self) -> bool {
        self.commands.iter().all(|c| match c.state() {
            State::Executing => c.name == "idle",
            State::Retired => true,
            _ => false,
        })
    }

    /// Takes a complete command (line plus literals) and queues a
    /// Command for it.
    pub fn add_command(&mut self, text: Vec<u8>) {
        // I love this feature
        let text = if text == b"quit" {
            b"arnt logout".to_vec()
        } else {
            text
        };

        let mut parser = Parser::new(text);
        let tag = match parser.tag() {
            Ok(tag) => tag,
            Err(e) => {
                self.core.enqueue_line(&format!("* BAD {e}"));
                self.core.record_syntax_error();
                return;
            },
        };

        let name = match parser.space().and_then(|_| parser.command()) {
            Ok(name) => name,
            Err(e) => {
                self.core.enqueue_line(&format!("* BAD {e}"));
                self.core.record_syntax_error();
                return;
            },
        };

        let (name, uid) = if name == "uid" {
            match parser.space().and_then(|_| parser.command()) {
                Ok(sub) => (sub, true),
                Err(e) => {
                    self.core.enqueue_line(&format!("* BAD {e}"));
                    self.core.record_syntax_error();
                    return;
                },
            }
        } else {
            (name, false)
        };

        if self.core.shutting_down && name != "logout" {
            let executing = self
                .commands
                .iter()
                .filter(|c| c.state() == State::Executing)
                .count();
            if executing == 0 {
                self.core
                    .enqueue_line("* BYE Server or process shutdown");
                self.core.closing = true;
            }
            self.core.enqueue_line(&format!(
                "{tag} NO May not be started during server shutdown",
            ));
            return;
        }

        self.next_serial += 1;
        match Command::create(
            self.next_serial,
            tag.clone(),
            &name,
            uid,
            parser,
        ) {
            Some(command) => {
                if !matches!(name.as_str(), "login" | "authenticate") {
                    debug!(
                        "{} Queued command {} {}{}",
                        self.core.log_prefix,
                        tag,
                        if uid { "uid " } else { "" },
                        name,
                    );
                }
                self.tags_look_natted &=
                    tag.len() == 4 && !tag.contains('.');
                self.commands.push_back(command);
                self.core.next_ok_time = self.core.now() + 117;
            },
            None => {
                if super::command::is_known_command(
                    &tag.to_ascii_lowercase(),
                ) {
                    self.core.enqueue_line(
                        "* OK  Hint: An IMAP command is prefixed by a tag. \
                         The command is the",
                    );
                    self.core.enqueue_line(&format!(
                        "* OK  second word on the line, after the tag. In \
                         your command, {name:?}",
                    ));
                    self.core.enqueue_line(&format!(
                        "* OK  is the command and {tag:?} is the tag.",
                    ));
                }
                self.core.record_syntax_error();
                self.core.enqueue_line(&format!(
                    "{tag} BAD No such command: {name}",
                ));
            },
        }
    }

    /// Routes a line of input to the command that reserved the input
    /// stream.
    pub fn feed_reserved(&mut self, line: &[u8]) {
        let serial = match self.core.reader {
            Some(serial) => serial,
            None => return,
        };
        let (core, commands) = (&mut self.core, &mut self.commands);
        if let Some(command) =
            commands.iter_mut().find(|c| c.serial == serial)
        {
            command.read(line, core);
        } else {
            core.reader = None;
        }
    }

    pub fn has_reserved_reader(&self) -> bool {
        self.core.reader.is_some()
    }

    /// Fails every command that has not yet retired. Used when the peer
    /// goes away.
    pub fn fail_all(&mut self, text: &str) {
        for command in &mut self.commands {
            if !matches!(command.state(), State::Retired) {
                command.error_no(text);
            }
        }
        self.core.mailbox = None;
    }

    /// The scheduler. Runs commands, emits what can be emitted, promotes
    /// queued commands as their groups allow, and applies the bad-client
    /// rate limit. Wake-up wishes (rate limiting, command timers) are
    /// left in `core.wake_after`.
    pub fn run_commands(&mut self) {
        if self.running {
            self.again = true;
            return;
        }
        self.running = true;
        self.again = true;

        while self.again {
            self.again = false;
            let (core, commands) = (&mut self.core, &mut self.commands);
            debug!(
                "{} Running {} commands",
                core.log_prefix,
                commands.len(),
            );

            // Step everything that is executing.
            for command in commands.iter_mut() {
                if command.state() == State::Executing {
                    if command.ok() {
                        command.step(core);
                    } else {
                        command.set_state(State::Finished);
                    }
                    if command.state() != State::Executing {
                        self.again = true;
                    }
                }
            }

            // Emit responses for leading finished commands and retire
            // them.
            loop {
                let Some(front) = commands.front() else { break };
                if front.state() != State::Finished {
                    break;
                }
                emit_queued(core, commands);
                let front = commands.front_mut().unwrap();
                core.release_reader(front.serial);
                front.emit_tagged(core);
                self.again = true;
            }

            // Slow down the command rate if the client keeps earning
            // NO/BAD responses: one second per recorded syntax error,
            // bounded at 16. An authenticated user without an inbox is
            // always held a little.
            let now = core.now();
            let mut delay =
                i64::from(core.syntax_errors.min(16)) + core.last_bad_time
                    - now;
            if delay < 0 {
                delay = 0;
            }
            if core
                .user
                .as_ref()
                .is_some_and(|u| !u.has_inbox)
                && delay < 4
            {
                delay = 4;
            }
            if delay > 0 && !commands.is_empty() {
                info!(
                    "{} Delaying next IMAP command for {delay} seconds \
                     (because of {} syntax errors)",
                    core.log_prefix, core.syntax_errors,
                );
                core.request_wake(Duration::from_secs(delay as u64));
                break;
            }

            // Promote the leading command, then any followers in the
            // same group.
            let lead = commands
                .iter()
                .position(|c| c.state() != State::Retired);
            if let Some(lead) = lead {
                {
                    let command = &mut commands[lead];
                    if command.state() == State::Unparsed {
                        command.parse(core);
                        self.again = true;
                    }
                    if !command.ok() {
                        command.set_state(State::Finished);
                        self.again = true;
                    } else if matches!(
                        command.state(),
                        State::Unparsed | State::Blocked,
                    ) {
                        command.set_state(State::Executing);
                        self.again = true;
                    }
                }

                let leader_group = commands[lead].group();
                if commands[lead].state() == State::Executing
                    && leader_group != 0
                {
                    for ix in lead + 1..commands.len() {
                        let command = &mut commands[ix];
                        match command.state() {
                            // A follower already running with the
                            // leader's group does not gate the commands
                            // behind it.
                            State::Executing
                                if command.group() == leader_group =>
                            {
                                continue;
                            },
                            State::Unparsed | State::Blocked => {},
                            _ => break,
                        }
                        if command.state() == State::Unparsed {
                            command.parse(core);
                        }
                        if !command.ok() {
                            command.set_state(State::Finished);
                            self.again = true;
                            break;
                        }
                        if command.group() == leader_group {
                            command.set_state(State::Executing);
                            self.again = true;
                        } else {
                            command.set_state(State::Blocked);
                            break;
                        }
                    }
                }
            }

            commands.retain(|c| c.state() != State::Retired);
        }

        self.running = false;

        if self.commands.is_empty()
            && self.core.shutting_down
            && !self.core.closing
        {
            self.core.closing = true;
        }

        // NAT-damage heuristic: short tags without dots suggest a client
        // known to sit behind connection-dropping NATs.
        if !self.nat_heuristic_done && self.core.user.is_some() {
            self.nat_heuristic_done = true;
            if self.tags_look_natted {
                self.core.client_bugs.nat = true;
                debug!(
                    "{} Activating client workaround: NAT",
                    self.core.log_prefix,
                );
            }
        }
    }

    /// Emits whatever queued untagged responses are currently legal.
    pub fn emit_responses(&mut self) {
        let (core, commands) = (&mut self.core, &mut self.commands);
        emit_queued(core, commands);
    }

    /// Sends the periodic `* OK` that keeps NAT mappings alive.
    pub fn defeat_nat(&mut self) {
        if !self.client_wants_keepalive() {
            return;
        }
        let now = self.core.now();
        if now < self.core.next_ok_time {
            return;
        }
        self.core.next_ok_time = now + 117;
        let time = Utc
            .timestamp_opt(now, 0)
            .single()
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        self.core
            .enqueue_line(&format!("* OK (NAT keepalive: {time})"));
    }

    /// When the next keepalive is due, if one is wanted.
    pub fn keepalive_due_in(&self) -> Option<Duration> {
        if !self.client_wants_keepalive() {
            return None;
        }
        let delta = self.core.next_ok_time - self.core.now();
        Some(Duration::from_secs(delta.max(0) as u64))
    }

    fn client_wants_keepalive(&self) -> bool {
        self.client_bugs_nat()
            && self.idle()
            && !matches!(
                self.core.state,
                SessionState::NotAuthenticated | SessionState::Logout,
            )
    }

    fn client_bugs_nat(&self) -> bool {
        self.core.client_bugs.nat
    }

    /// The inactivity allowance for the current state.
    pub fn timeout(&self) -> Duration {
        match self.core.state {
            SessionState::NotAuthenticated => Duration::from_secs(120),
            _ if self.commands.iter().any(|c| {
                c.state() == State::Executing && c.name == "idle"
            }) =>
            {
                Duration::from_secs(3600)
            },
            _ => Duration::from_secs(1860),
        }
    }
}

/// Emits queued untagged responses, honouring the expunge-suppression
/// rules.
///
/// A response that renumbers messages may only go out when nothing that
/// could be using sequence numbers is in flight: an executing IDLE (or a
/// finished command waiting for its tagged line) permits it, any other
/// executing command, any group 2/3 command, or any MSN-addressed
/// command forbids it.
fn emit_queued(core: &mut SessionCore, commands: &VecDeque<Command>) {
    if core.client_bugs.no_unsolicited && commands.is_empty() {
        return;
    }

    let mut can = false;
    let mut cannot = false;
    for c in commands {
        if c.state() == State::Retired {
            continue;
        }
        if c.state() == State::Executing && c.name == "idle" {
            can = true;
        } else if c.state() == State::Executing {
            cannot = true;
        } else if c.group() == 2 || c.group() == 3 {
            cannot = true;
        } else if c.uses_msn() && c.name != "copy" {
            cannot = true;
        } else if c.state() == State::Finished && !c.tag.is_empty() {
            can = true;
        }
    }
    if cannot {
        can = false;
    }

    let mut responses = std::mem::take(&mut core.responses);
    for response in &mut responses {
        if !response.meaningful {
            response.sent = true;
            continue;
        }
        if response.sent || (response.changes_msn() && !can) {
            continue;
        }

        let rendered = match core.mailbox {
            Some(ref mut mailbox) => response
                .render(&mut mailbox.msns, core.capabilities.qresync),
            // No mailbox: per-message responses are moot, plain lines
            // still go out.
            None => {
                if response.uid().is_some() {
                    None
                } else {
                    response.render(&mut Vec::new(), false)
                }
            },
        };

        if let Some(text) = rendered {
            core.out.extend_from_slice(b"* ");
            core.out.extend_from_slice(text.as_bytes());
            core.out.extend_from_slice(b"\r\n");
        }
        response.sent = true;
    }
    responses.retain(|r| !r.sent);
    core.responses = responses;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::run_backend;
    use crate::db::testing::ScriptedBackend;
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

    /// A session with a user and a five-message mailbox already
    /// selected, so FETCH/STORE commands can be queued directly.
    ///
    /// Queries issued by the commands only complete once someone runs a
    /// backend against the returned request stream; until then the
    /// commands stay Executing, which is exactly what the scheduler
    /// tests need to observe.
    fn selected_session(
        pool: Pool,
        waker: mpsc::UnboundedSender<()>,
    ) -> Session {
        let mut core = SessionCore::new(
            pool,
            config(),
            LogPrefix::new("imap".to_owned(), 1),
            waker,
        );
        core.user = Some(User {
            id: 3,
            login: "nikita".to_owned(),
            has_inbox: true,
        });
        core.set_state(SessionState::Authenticated);
        core.select_mailbox(SelectedMailbox {
            id: 17,
            name: "INBOX".to_owned(),
            read_only: false,
            uidvalidity: 1,
            uidnext: 6,
            highestmodseq: 8,
            msns: vec![1, 2, 3, 4, 5],
        });
        Session::new(core)
    }

    fn state_of(session: &Session, tag: &str) -> State {
        session
            .commands
            .iter()
            .find(|c| c.tag == tag)
            .unwrap_or_else(|| panic!("no command tagged {tag}"))
            .state()
    }

    #[test]
    fn solitary_leader_runs_alone() {
        let (pool, _requests) = Pool::new();
        let (waker, _woken) = mpsc::unbounded_channel();
        let mut session = selected_session(pool, waker);

        // SELECT is group 0 and suspends on its mailbox query.
        session.add_command(b"A1 SELECT INBOX".to_vec());
        session.add_command(b"A2 NOOP".to_vec());
        session.run_commands();

        assert_eq!(State::Executing, state_of(&session, "A1"));
        assert_eq!(State::Unparsed, state_of(&session, "A2"));
    }

    #[test]
    fn same_group_followers_promoted_in_one_pass() {
        let (pool, _requests) = Pool::new();
        let (waker, _woken) = mpsc::unbounded_channel();
        let mut session = selected_session(pool, waker);

        session.add_command(b"A1 UID FETCH 1:2 FLAGS".to_vec());
        session.add_command(b"A2 UID FETCH 3:4 FLAGS".to_vec());
        session.run_commands();

        assert_eq!(State::Executing, state_of(&session, "A1"));
        assert_eq!(State::Executing, state_of(&session, "A2"));
    }

    #[test]
    fn differing_group_follower_is_left_blocked() {
        let (pool, _requests) = Pool::new();
        let (waker, _woken) = mpsc::unbounded_channel();
        let mut session = selected_session(pool, waker);

        session.add_command(b"A1 UID FETCH 1:2 FLAGS".to_vec());
        session.add_command(b"A2 STORE 1 +FLAGS (\\Seen)".to_vec());
        session.add_command(b"A3 UID FETCH 3:4 FLAGS".to_vec());
        session.run_commands();

        assert_eq!(State::Executing, state_of(&session, "A1"));
        assert_eq!(State::Blocked, state_of(&session, "A2"));
        // The flag mutator gates everything behind it too.
        assert_eq!(State::Unparsed, state_of(&session, "A3"));
    }

    #[test]
    fn late_arrival_joins_executing_group() {
        let (pool, _requests) = Pool::new();
        let (waker, _woken) = mpsc::unbounded_channel();
        let mut session = selected_session(pool, waker);

        session.add_command(b"A1 UID FETCH 1:2 FLAGS".to_vec());
        session.add_command(b"A2 UID FETCH 3:4 FLAGS".to_vec());
        session.run_commands();
        assert_eq!(State::Executing, state_of(&session, "A1"));
        assert_eq!(State::Executing, state_of(&session, "A2"));

        // A third command arrives on a later read event while the first
        // two are still waiting on the store; it shares their group and
        // must not be serialised behind them.
        session.add_command(b"A3 UID FETCH 5 FLAGS".to_vec());
        session.run_commands();

        assert_eq!(State::Executing, state_of(&session, "A1"));
        assert_eq!(State::Executing, state_of(&session, "A2"));
        assert_eq!(State::Executing, state_of(&session, "A3"));
    }

    #[test]
    fn concurrent_fetches_answer_in_receipt_order() {
        run_concurrent_fetches();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_concurrent_fetches() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (pool, requests) = Pool::new();
                let (waker, mut woken) = mpsc::unbounded_channel();
                let mut session = selected_session(pool, waker);

                session.add_command(b"A1 UID FETCH 1:2 FLAGS".to_vec());
                session.add_command(b"A2 UID FETCH 3:4 FLAGS".to_vec());
                session.run_commands();
                session.add_command(b"A3 UID FETCH 5 FLAGS".to_vec());
                session.run_commands();
                assert_eq!(State::Executing, state_of(&session, "A3"));

                // Only now does the store start answering.
                let rows: Vec<crate::db::Row> = (1..=5)
                    .map(|uid| {
                        db_row! {
                            "uid" => uid as i64,
                            "flags" => "\\Seen",
                            "modseq" => 4i64,
                            "internaldate" => 1_700_000_000i64,
                            "rfc822size" => 128i64,
                        }
                    })
                    .collect();
                let backend = ScriptedBackend::new()
                    .on("rfc822size from mailbox_messages", rows);
                tokio::task::spawn_local(run_backend(backend, requests));

                for _ in 0..100 {
                    if session.commands.is_empty() {
                        break;
                    }
                    let _ = woken.recv().await;
                    session.run_commands();
                }
                assert!(session.commands.is_empty());

                let out =
                    String::from_utf8(session.core.out.clone()).unwrap();
                let a1 = out.find("A1 OK").expect("no A1 OK");
                let a2 = out.find("A2 OK").expect("no A2 OK");
                let a3 = out.find("A3 OK").expect("no A3 OK");
                assert!(a1 < a2 && a2 < a3, "out of order:\n{out}");
                // All five messages were reported exactly once.
                assert_eq!(5, out.matches(" FETCH (").count());
            })
            .await;
    }
}

