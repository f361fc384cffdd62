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

//! One object per IMAP command, from parse to retirement.
//!
//! A command is created as soon as its full text (line plus literals) has
//! been read, and then walks Unparsed → Blocked/Executing → Finished →
//! Retired under the session scheduler. Execution is cooperative: a
//! `step()` must return promptly, leaving queries registered with the
//! store, and is called again when the session is woken.

use log::{debug, info};

use super::fetch::Fetch;
use super::parser::{ParseError, Parser, SequenceSet};
use super::response::ImapResponse;
use super::session::{SelectedMailbox, SessionCore, SessionState, User};
use crate::db::{Query, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Unparsed,
    Blocked,
    Executing,
    Finished,
    Retired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RespType {
    Ok,
    No,
    Bad,
}

impl RespType {
    fn name(self) -> &'static str {
        match self {
            RespType::Ok => "OK",
            RespType::No => "NO",
            RespType::Bad => "BAD",
        }
    }
}

pub struct Command {
    pub serial: u64,
    pub tag: String,
    pub name: String,
    pub uid: bool,
    state: State,
    group: u8,
    parser: Option<Parser>,
    verb: Verb,
    tagged: Option<(RespType, String)>,
    /// This command's own diagnostic untagged lines, sent right before
    /// the tagged response.
    untagged: Vec<String>,
}

enum Verb {
    Capability,
    Noop,
    Logout,
    Login(Login),
    Authenticate(Authenticate),
    Enable(Vec<String>),
    Select(Select),
    Close(CloseCmd),
    Unselect,
    Expunge(ExpungeCmd),
    Fetch(Box<Fetch>),
    Store(StoreCmd),
    Search(SearchCmd),
    Idle(IdleCmd),
    Compress,
}

static KNOWN: &[&str] = &[
    "capability",
    "noop",
    "logout",
    "login",
    "authenticate",
    "enable",
    "select",
    "examine",
    "close",
    "unselect",
    "expunge",
    "fetch",
    "store",
    "search",
    "idle",
    "compress",
];

pub fn is_known_command(name: &str) -> bool {
    KNOWN.contains(&name)
}

impl Command {
    /// Creates a command for `name`, or `None` if the verb is unknown
    /// (or not valid under the given UID prefix).
    pub fn create(
        serial: u64,
        tag: String,
        name: &str,
        uid: bool,
        parser: Parser,
    ) -> Option<Command> {
        if uid && !matches!(name, "fetch" | "store" | "search" | "expunge") {
            return None;
        }

        let verb = match name {
            "capability" => Verb::Capability,
            "noop" => Verb::Noop,
            "logout" => Verb::Logout,
            "login" => Verb::Login(Login::default()),
            "authenticate" => Verb::Authenticate(Authenticate::default()),
            "enable" => Verb::Enable(Vec::new()),
            "select" => Verb::Select(Select::new(false)),
            "examine" => Verb::Select(Select::new(true)),
            "close" => Verb::Close(CloseCmd::default()),
            "unselect" => Verb::Unselect,
            "expunge" => Verb::Expunge(ExpungeCmd::default()),
            "fetch" => Verb::Fetch(Box::default()),
            "store" => Verb::Store(StoreCmd::default()),
            "search" => Verb::Search(SearchCmd::default()),
            "idle" => Verb::Idle(IdleCmd::default()),
            "compress" => Verb::Compress,
            _ => return None,
        };

        Some(Command {
            serial,
            tag,
            name: name.to_owned(),
            uid,
            state: State::Unparsed,
            group: 0,
            parser: Some(parser),
            verb,
            tagged: None,
            untagged: Vec::new(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn ok(&self) -> bool {
        self.tagged
            .as_ref()
            .map_or(true, |&(t, _)| t == RespType::Ok)
    }

    /// The concurrency class: 0 solitary, 1 UID-based read, 2 MSN user,
    /// 3 flag mutator. Meaningful only once parsed.
    pub fn group(&self) -> u8 {
        self.group
    }

    /// Whether this command addresses messages by sequence number, which
    /// gates EXPUNGE emission. COPY would be exempt per RFC 2180, but
    /// the exemption is moot while COPY addresses messages by UID only.
    pub fn uses_msn(&self) -> bool {
        !self.uid && matches!(self.name.as_str(), "fetch" | "store" | "search")
    }

    /// Records the command's fate. The first call wins, matching the
    /// rule that an errored command stops doing anything else.
    pub fn finish(&mut self, t: RespType, text: impl Into<String>) {
        if self.tagged.is_none() {
            self.tagged = Some((t, text.into()));
        }
        self.state = State::Finished;
    }

    pub fn error_no(&mut self, text: impl Into<String>) {
        self.finish(RespType::No, text);
    }

    /// Writes this command's own untagged lines and its tagged response.
    pub fn emit_tagged(&mut self, core: &mut SessionCore) {
        for line in std::mem::take(&mut self.untagged) {
            core.enqueue_line(&format!("* {line}"));
        }
        let (t, text) = self
            .tagged
            .take()
            .unwrap_or((RespType::Ok, "done".to_owned()));
        core.enqueue_line(&format!("{} {} {}", self.tag, t.name(), text));
        self.state = State::Retired;
    }

    /// Parses the command text. On failure the command is finished with
    /// a BAD and the session's syntax-error counter is bumped.
    pub fn parse(&mut self, core: &mut SessionCore) {
        let mut parser = self.parser.take().expect("parsed twice");

        if let Err(e) = self.parse_verb(&mut parser, core) {
            debug!("{} Parse error: {e}", core.log_prefix);
            core.record_syntax_error();
            self.finish(RespType::Bad, e.message);
            return;
        }

        if !self.allowed_now(core) {
            self.finish(
                RespType::No,
                format!("{} not allowed in this state", self.name),
            );
            return;
        }

        self.group = match (self.name.as_str(), self.uid) {
            ("fetch", true) | ("search", true) => 1,
            ("fetch", false) | ("search", false) => 2,
            ("store", _) => 3,
            _ => 0,
        };
        self.state = State::Blocked;
    }

    fn parse_verb(
        &mut self,
        p: &mut Parser,
        core: &mut SessionCore,
    ) -> Result<(), ParseError> {
        match self.verb {
            Verb::Capability
            | Verb::Noop
            | Verb::Logout
            | Verb::Unselect
            | Verb::Compress
            | Verb::Close(_) => p.end(),

            Verb::Idle(_) => p.end(),

            Verb::Login(ref mut login) => {
                p.space()?;
                login.user =
                    String::from_utf8_lossy(&p.astring()?).into_owned();
                p.space()?;
                login.pass =
                    String::from_utf8_lossy(&p.astring()?).into_owned();
                p.end()
            },

            Verb::Authenticate(ref mut auth) => {
                p.space()?;
                auth.mechanism = p.atom()?.to_ascii_lowercase();
                if !p.at_end() {
                    p.space()?;
                    auth.initial = Some(p.atom()?);
                }
                p.end()
            },

            Verb::Enable(ref mut caps) => {
                loop {
                    p.space()?;
                    caps.push(p.atom()?.to_ascii_uppercase());
                    if p.at_end() {
                        break;
                    }
                }
                Ok(())
            },

            Verb::Select(ref mut select) => {
                p.space()?;
                select.name =
                    String::from_utf8_lossy(&p.astring()?).into_owned();
                // CONDSTORE select parameter
                if !p.at_end() {
                    p.require(" (")?;
                    let parm = p.atom()?.to_ascii_uppercase();
                    if parm == "CONDSTORE" {
                        core.capabilities.condstore = true;
                    }
                    p.require(")")?;
                }
                p.end()
            },

            Verb::Expunge(ref mut expunge) => {
                if self.uid {
                    p.space()?;
                    expunge.uid_set = Some(p.sequence_set()?);
                }
                p.end()
            },

            Verb::Fetch(ref mut fetch) => fetch.parse(p, self.uid, core),

            Verb::Store(ref mut store) => store.parse(p),

            Verb::Search(ref mut search) => search.parse(p),
        }
    }

    fn allowed_now(&self, core: &SessionCore) -> bool {
        let state = core.state;
        match self.verb {
            Verb::Capability | Verb::Noop | Verb::Logout | Verb::Compress => {
                true
            },
            Verb::Login(_) | Verb::Authenticate(_) => {
                state == SessionState::NotAuthenticated
            },
            Verb::Enable(_) | Verb::Select(_) | Verb::Idle(_) => matches!(
                state,
                SessionState::Authenticated | SessionState::Selected,
            ),
            Verb::Close(_)
            | Verb::Unselect
            | Verb::Expunge(_)
            | Verb::Fetch(_)
            | Verb::Store(_)
            | Verb::Search(_) => state == SessionState::Selected,
        }
    }

    /// One cooperative execution step.
    pub fn step(&mut self, core: &mut SessionCore) {
        match self.verb {
            Verb::Capability => {
                self.untagged
                    .push(format!("CAPABILITY {}", core.capability_string()));
                self.finish(RespType::Ok, "done");
            },

            Verb::Noop => {
                self.finish(RespType::Ok, "done");
            },

            Verb::Compress => {
                self.finish(
                    RespType::No,
                    "COMPRESS=DEFLATE is not available",
                );
            },

            Verb::Logout => {
                self.untagged.push("BYE Have a nice day".to_owned());
                core.set_state(SessionState::Logout);
                core.closing = true;
                self.finish(RespType::Ok, "done");
            },

            Verb::Enable(ref caps) => {
                let mut enabled = Vec::new();
                for cap in caps {
                    match cap.as_str() {
                        "CONDSTORE" => {
                            core.capabilities.condstore = true;
                            enabled.push("CONDSTORE");
                        },
                        "QRESYNC" => {
                            core.capabilities.qresync = true;
                            core.capabilities.condstore = true;
                            enabled.push("QRESYNC");
                        },
                        _ => {},
                    }
                }
                self.untagged
                    .push(format!("ENABLED {}", enabled.join(" ")));
                self.finish(RespType::Ok, "done");
            },

            Verb::Login(_) => self.step_login(core),
            Verb::Authenticate(_) => self.step_authenticate(core),
            Verb::Select(_) => self.step_select(core),
            Verb::Close(_) => self.step_close(core),

            Verb::Unselect => {
                core.deselect();
                self.finish(RespType::Ok, "done");
            },

            Verb::Expunge(_) => self.step_expunge(core),

            Verb::Fetch(_) => {
                let Verb::Fetch(ref mut fetch) = self.verb else {
                    unreachable!()
                };
                if let Some((t, text)) = fetch.step(self.uid, core) {
                    self.finish(t, text);
                }
            },

            Verb::Store(_) => self.step_store(core),
            Verb::Search(_) => self.step_search(core),
            Verb::Idle(_) => self.step_idle(core),
        }
    }

    /// Feeds a line of reserved input to this command. Only IDLE and
    /// AUTHENTICATE reserve input.
    pub fn read(&mut self, line: &[u8], core: &mut SessionCore) {
        match self.verb {
            Verb::Idle(_) => {
                if line.eq_ignore_ascii_case(b"done") {
                    core.release_reader(self.serial);
                    self.finish(RespType::Ok, "done");
                } else {
                    core.release_reader(self.serial);
                    self.finish(
                        RespType::Bad,
                        "Expected DONE to end IDLE",
                    );
                }
            },

            Verb::Authenticate(ref mut auth) => {
                core.release_reader(self.serial);
                let line = String::from_utf8_lossy(line).into_owned();
                if line == "*" {
                    self.finish(RespType::Bad, "SASL aborted");
                    return;
                }
                auth.initial = Some(line);
                // The next step picks the response up.
            },

            _ => {
                core.release_reader(self.serial);
                self.finish(RespType::Bad, "Unexpected input");
            },
        }
    }

    fn step_login(&mut self, core: &mut SessionCore) {
        let Verb::Login(ref mut login) = self.verb else { unreachable!() };

        let Some(ref query) = login.query else {
            let query = login_query(&login.user, &login.pass);
            core.execute(&query);
            login.query = Some(query);
            return;
        };

        if !query.done() {
            return;
        }

        if query.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        match query.next_row() {
            Some(row) => {
                let user = User {
                    id: row.get_int("id"),
                    login: login.user.clone(),
                    has_inbox: !row.is_null("inbox"),
                };
                core.authenticated(user, "login");
                let capabilities = core.capability_string();
                self.finish(
                    RespType::Ok,
                    format!("[CAPABILITY {capabilities}] done"),
                );
            },
            None => {
                core.record_syntax_error();
                self.finish(RespType::No, "Login failed");
            },
        }
    }

    fn step_authenticate(&mut self, core: &mut SessionCore) {
        let Verb::Authenticate(ref mut auth) = self.verb else {
            unreachable!()
        };

        if auth.mechanism != "plain" {
            self.finish(RespType::No, "Unsupported SASL mechanism");
            return;
        }

        // RFC 2595 PLAIN: authorise-id NUL authenticate-id NUL password.
        if auth.query.is_none() {
            let Some(ref initial) = auth.initial else {
                if !auth.challenged {
                    auth.challenged = true;
                    core.reserve(self.serial);
                    core.enqueue_line("+ ");
                }
                return;
            };

            let decoded = base64::decode(initial)
                .ok()
                .and_then(|d| String::from_utf8(d).ok());
            let Some(decoded) = decoded else {
                core.record_syntax_error();
                self.finish(RespType::Bad, "Invalid base64");
                return;
            };

            let mut parts = decoded.split('\x00');
            let (Some(authorise), Some(user), Some(pass), None) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                core.record_syntax_error();
                self.finish(RespType::Bad, "Invalid SASL PLAIN syntax");
                return;
            };

            if !authorise.is_empty() && authorise != user {
                self.finish(
                    RespType::No,
                    "authorise-id must match authenticate-id",
                );
                return;
            }

            auth.user = user.to_owned();
            let query = login_query(user, pass);
            core.execute(&query);
            auth.query = Some(query);
            return;
        }

        let query = auth.query.as_ref().unwrap();
        if !query.done() {
            return;
        }
        if query.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        match query.next_row() {
            Some(row) => {
                let user = User {
                    id: row.get_int("id"),
                    login: auth.user.clone(),
                    has_inbox: !row.is_null("inbox"),
                };
                core.authenticated(user, "plain");
                let capabilities = core.capability_string();
                self.finish(
                    RespType::Ok,
                    format!("[CAPABILITY {capabilities}] done"),
                );
            },
            None => {
                core.record_syntax_error();
                self.finish(RespType::No, "Authentication failed");
            },
        }
    }

    fn step_select(&mut self, core: &mut SessionCore) {
        let Verb::Select(ref mut select) = self.verb else { unreachable!() };

        let Some(ref qm) = select.mailbox_query else {
            let query = Query::new(
                "select id, uidvalidity, uidnext, nextmodseq \
                 from mailboxes where name=$1 and deleted='f'",
                vec![Value::Text(select.name.clone())],
            );
            core.execute(&query);
            select.mailbox_query = Some(query);
            return;
        };

        if !qm.done() {
            return;
        }
        if qm.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        if select.mailbox.is_none() {
            match qm.next_row() {
                Some(row) => {
                    select.mailbox = Some((
                        row.get_int("id"),
                        row.get_int("uidvalidity") as u32,
                        row.get_int("uidnext") as u32,
                        row.get_int("nextmodseq") as u64,
                    ));
                },
                None => {
                    self.finish(RespType::No, "No such mailbox");
                    return;
                },
            }
        }

        let (id, uidvalidity, uidnext, nextmodseq) = select.mailbox.unwrap();

        let Some(ref ql) = select.message_query else {
            let query = Query::new(
                "select uid, flags from mailbox_messages \
                 where mailbox=$1 order by uid",
                vec![Value::Int(id)],
            );
            core.execute(&query);
            select.message_query = Some(query);
            return;
        };

        if !ql.done() {
            return;
        }
        if ql.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        let mut msns = Vec::new();
        let mut recent = 0u32;
        let mut unseen_msn = None;
        while let Some(row) = ql.next_row() {
            let uid = row.get_int("uid") as u32;
            let flags = row.get_text("flags").to_owned();
            msns.push(uid);
            if flags_contain(&flags, "\\Recent") {
                recent += 1;
            }
            if unseen_msn.is_none() && !flags_contain(&flags, "\\Seen") {
                unseen_msn = Some(msns.len() as u32);
            }
        }

        // Switching mailboxes ends the previous session.
        core.deselect();

        self.untagged.push(
            "FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)"
                .to_owned(),
        );
        self.untagged.push(format!("{} EXISTS", msns.len()));
        self.untagged.push(format!("{recent} RECENT"));
        if let Some(unseen) = unseen_msn {
            self.untagged
                .push(format!("OK [UNSEEN {unseen}] first unseen"));
        }
        self.untagged
            .push(format!("OK [UIDVALIDITY {uidvalidity}] ok"));
        self.untagged.push(format!("OK [UIDNEXT {uidnext}] ok"));
        self.untagged
            .push(format!("OK [HIGHESTMODSEQ {nextmodseq}] ok"));
        if select.read_only {
            self.untagged
                .push("OK [PERMANENTFLAGS ()] read-only".to_owned());
        } else {
            self.untagged.push(
                "OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \
                 \\Seen \\Draft)] ok"
                    .to_owned(),
            );
        }

        let read_only = select.read_only;
        core.select_mailbox(SelectedMailbox {
            id,
            name: select.name.clone(),
            read_only,
            uidvalidity,
            uidnext,
            highestmodseq: nextmodseq,
            msns,
        });
        info!(
            "{} Starting session on mailbox {}",
            core.log_prefix, select.name,
        );

        self.finish(
            RespType::Ok,
            if read_only {
                "[READ-ONLY] done"
            } else {
                "[READ-WRITE] done"
            },
        );
    }

    fn step_close(&mut self, core: &mut SessionCore) {
        let Verb::Close(ref mut close) = self.verb else { unreachable!() };

        let Some(mailbox_id) = core.mailbox.as_ref().map(|m| m.id) else {
            self.finish(RespType::No, "No mailbox selected");
            return;
        };
        let read_only =
            core.mailbox.as_ref().map_or(true, |m| m.read_only);

        // CLOSE expunges silently; on a read-only mailbox it just
        // deselects.
        if !read_only && close.expunge.is_none() {
            let query = Query::new(
                "delete from mailbox_messages \
                 where mailbox=$1 and flags like '%\\Deleted%'",
                vec![Value::Int(mailbox_id)],
            );
            core.execute(&query);
            close.expunge = Some(query);
            return;
        }

        if let Some(ref q) = close.expunge {
            if !q.done() {
                return;
            }
        }

        core.deselect();
        self.finish(RespType::Ok, "done");
    }

    fn step_expunge(&mut self, core: &mut SessionCore) {
        let Verb::Expunge(ref mut expunge) = self.verb else {
            unreachable!()
        };

        let Some(mailbox) = core.mailbox.as_ref() else {
            self.finish(RespType::No, "No mailbox selected");
            return;
        };
        if mailbox.read_only {
            self.finish(RespType::No, "Mailbox is read-only");
            return;
        }
        let mailbox_id = mailbox.id;
        let largest_uid = mailbox.msns.last().copied().unwrap_or(0);

        let Some(ref scan) = expunge.scan else {
            let query = Query::new(
                "select uid, flags from mailbox_messages \
                 where mailbox=$1 order by uid",
                vec![Value::Int(mailbox_id)],
            );
            core.execute(&query);
            expunge.scan = Some(query);
            return;
        };

        if !scan.done() {
            return;
        }
        if scan.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        if expunge.delete.is_none() {
            let chosen = expunge
                .uid_set
                .as_ref()
                .map(|set| set.expand_unclamped(largest_uid));
            let mut doomed = Vec::new();
            while let Some(row) = scan.next_row() {
                let uid = row.get_int("uid") as u32;
                if !flags_contain(row.get_text("flags"), "\\Deleted") {
                    continue;
                }
                if let Some(ref chosen) = chosen {
                    if !chosen.contains(&uid) {
                        continue;
                    }
                }
                doomed.push(uid);
            }

            if doomed.is_empty() {
                self.finish(RespType::Ok, "done");
                return;
            }

            let query = Query::new(
                "delete from mailbox_messages \
                 where mailbox=$1 and uid=any($2)",
                vec![
                    Value::Int(mailbox_id),
                    Value::IntSet(
                        doomed.iter().map(|&u| i64::from(u)).collect(),
                    ),
                ],
            );
            core.execute(&query);
            for uid in doomed {
                core.respond(ImapResponse::expunge(uid));
            }
            expunge.delete = Some(query);
            return;
        }

        let delete = expunge.delete.as_ref().unwrap();
        if !delete.done() {
            return;
        }
        if delete.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        self.finish(RespType::Ok, "done");
    }

    fn step_store(&mut self, core: &mut SessionCore) {
        let Verb::Store(ref mut store) = self.verb else { unreachable!() };

        let Some(mailbox) = core.mailbox.as_ref() else {
            self.finish(RespType::No, "No mailbox selected");
            return;
        };
        if mailbox.read_only {
            self.finish(RespType::No, "Mailbox is read-only");
            return;
        }
        let mailbox_id = mailbox.id;
        let modseq = mailbox.highestmodseq;

        let uids = if self.uid {
            let largest = mailbox.msns.last().copied().unwrap_or(0);
            store
                .set
                .as_ref()
                .expect("parsed store has a set")
                .expand_unclamped(largest)
                .into_iter()
                .filter(|u| mailbox.msns.contains(u))
                .collect::<Vec<u32>>()
        } else {
            let count = mailbox.msns.len() as u32;
            store
                .set
                .as_ref()
                .expect("parsed store has a set")
                .expand(count)
                .into_iter()
                .filter_map(|msn| {
                    mailbox.msns.get(msn as usize - 1).copied()
                })
                .collect::<Vec<u32>>()
        };

        let Some(ref scan) = store.scan else {
            let query = Query::new(
                "select uid, flags, modseq from mailbox_messages \
                 where mailbox=$1 and uid=any($2) order by uid",
                vec![
                    Value::Int(mailbox_id),
                    Value::IntSet(
                        uids.iter().map(|&u| i64::from(u)).collect(),
                    ),
                ],
            );
            core.execute(&query);
            store.scan = Some(query);
            return;
        };

        if !scan.done() {
            return;
        }
        if scan.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        if !store.applied {
            store.applied = true;
            while let Some(row) = scan.next_row() {
                let uid = row.get_int("uid") as u32;
                let old_modseq = row.get_int("modseq") as u64;

                if let Some(limit) = store.unchanged_since {
                    if old_modseq > limit {
                        store.modified.push(uid);
                        continue;
                    }
                }

                let old = parse_flags(row.get_text("flags"));
                let new = store.op.apply(&old, &store.flags);
                let new_text = new.join(" ");

                let update = Query::new(
                    "update mailbox_messages \
                     set flags=$1, modseq=$2 \
                     where mailbox=$3 and uid=$4",
                    vec![
                        Value::Text(new_text.clone()),
                        Value::Int(modseq as i64 + 1),
                        Value::Int(mailbox_id),
                        Value::Int(i64::from(uid)),
                    ],
                );
                core.execute(&update);
                store.updates.push(update);

                if !store.silent {
                    let mut attrs = format!("FLAGS ({new_text})");
                    if core.capabilities.condstore {
                        attrs = format!("{attrs} MODSEQ ({})", modseq + 1);
                    }
                    if self.uid {
                        attrs = format!("UID {uid} {attrs}");
                    }
                    core.respond(ImapResponse::fetch(uid, attrs));
                }
            }

            if !store.updates.is_empty() {
                let bump = Query::new(
                    "update mailboxes set nextmodseq=nextmodseq+1 \
                     where id=$1",
                    vec![Value::Int(mailbox_id)],
                );
                core.execute(&bump);
                store.updates.push(bump);
                if let Some(mailbox) = core.mailbox.as_mut() {
                    mailbox.highestmodseq += 1;
                }
            }
        }

        if store.updates.iter().any(|q| !q.done()) {
            return;
        }
        if store.updates.iter().any(|q| q.failed()) {
            self.finish(RespType::No, "Database error");
            return;
        }

        if store.modified.is_empty() {
            self.finish(RespType::Ok, "done");
        } else {
            let modified = store
                .modified
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.finish(
                RespType::Ok,
                format!("[MODIFIED {modified}] conditional store failed"),
            );
        }
    }

    fn step_search(&mut self, core: &mut SessionCore) {
        let Verb::Search(ref mut search) = self.verb else { unreachable!() };

        let Some(mailbox) = core.mailbox.as_ref() else {
            self.finish(RespType::No, "No mailbox selected");
            return;
        };
        let mailbox_id = mailbox.id;

        let Some(ref scan) = search.scan else {
            let query = Query::new(
                "select uid, flags from mailbox_messages \
                 where mailbox=$1 order by uid",
                vec![Value::Int(mailbox_id)],
            );
            core.execute(&query);
            search.scan = Some(query);
            return;
        };

        if !scan.done() {
            return;
        }
        if scan.failed() {
            self.finish(RespType::No, "Database error");
            return;
        }

        let mailbox = core.mailbox.as_ref().unwrap();
        let mut hits = Vec::<String>::new();
        while let Some(row) = scan.next_row() {
            let uid = row.get_int("uid") as u32;
            let flags = row.get_text("flags");
            let msn = mailbox
                .msns
                .iter()
                .position(|&u| u == uid)
                .map(|ix| ix as u32 + 1);

            if search.matches(uid, msn, flags, mailbox) {
                if self.uid {
                    hits.push(uid.to_string());
                } else if let Some(msn) = msn {
                    hits.push(msn.to_string());
                }
            }
        }

        self.untagged
            .push(format!("SEARCH {}", hits.join(" ")).trim_end().to_owned());
        self.finish(RespType::Ok, "done");
    }

    fn step_idle(&mut self, core: &mut SessionCore) {
        let Verb::Idle(ref mut idle) = self.verb else { unreachable!() };

        if !idle.started {
            idle.started = true;
            core.reserve(self.serial);
            core.enqueue_line("+ idling");
        }
        // Stays Executing until DONE arrives via read().
    }
}

fn login_query(user: &str, pass: &str) -> Query {
    Query::new(
        "select u.id, m.id as inbox from users u \
         left join mailboxes m on (m.owner=u.id and m.name='INBOX') \
         where u.login=$1 and u.secret=$2",
        vec![Value::Text(user.to_owned()), Value::Text(pass.to_owned())],
    )
}

pub fn parse_flags(text: &str) -> Vec<String> {
    text.split_ascii_whitespace().map(str::to_owned).collect()
}

pub fn flags_contain(text: &str, flag: &str) -> bool {
    text.split_ascii_whitespace()
        .any(|f| f.eq_ignore_ascii_case(flag))
}

#[derive(Default)]
struct Login {
    user: String,
    pass: String,
    query: Option<Query>,
}

#[derive(Default)]
struct Authenticate {
    mechanism: String,
    initial: Option<String>,
    user: String,
    challenged: bool,
    query: Option<Query>,
}

struct Select {
    name: String,
    read_only: bool,
    mailbox_query: Option<Query>,
    message_query: Option<Query>,
    mailbox: Option<(i64, u32, u32, u64)>,
}

impl Select {
    fn new(read_only: bool) -> Self {
        Select {
            name: String::new(),
            read_only,
            mailbox_query: None,
            message_query: None,
            mailbox: None,
        }
    }
}

#[derive(Default)]
struct CloseCmd {
    expunge: Option<Query>,
}

#[derive(Default)]
struct ExpungeCmd {
    uid_set: Option<SequenceSet>,
    scan: Option<Query>,
    delete: Option<Query>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StoreOp {
    Add,
    Remove,
    Replace,
}

impl Default for StoreOp {
    fn default() -> Self {
        StoreOp::Replace
    }
}

impl StoreOp {
    fn apply(self, old: &[String], change: &[String]) -> Vec<String> {
        match self {
            StoreOp::Replace => change.to_vec(),
            StoreOp::Add => {
                let mut out = old.to_vec();
                for flag in change {
                    if !out.iter().any(|f| f.eq_ignore_ascii_case(flag)) {
                        out.push(flag.clone());
                    }
                }
                out
            },
            StoreOp::Remove => old
                .iter()
                .filter(|f| {
                    !change.iter().any(|c| c.eq_ignore_ascii_case(f))
                })
                .cloned()
                .collect(),
        }
    }
}

#[derive(Default)]
struct StoreCmd {
    set: Option<SequenceSet>,
    op: StoreOp,
    silent: bool,
    flags: Vec<String>,
    unchanged_since: Option<u64>,
    scan: Option<Query>,
    applied: bool,
    updates: Vec<Query>,
    modified: Vec<u32>,
}

impl StoreCmd {
    fn parse(&mut self, p: &mut Parser) -> Result<(), ParseError> {
        p.space()?;
        self.set = Some(p.sequence_set()?);
        p.space()?;

        if p.next_char() == Some(b'(') {
            p.require("(")?;
            let word = p.atom()?.to_ascii_uppercase();
            if word != "UNCHANGEDSINCE" {
                return Err(ParseError {
                    message: "expected UNCHANGEDSINCE".to_owned(),
                });
            }
            p.space()?;
            self.unchanged_since = Some(u64::from(p.number()?));
            p.require(")")?;
            p.space()?;
        }

        let mut item = p.atom()?.to_ascii_uppercase();
        if let Some(c) = item.chars().next() {
            if c == '+' {
                self.op = StoreOp::Add;
                item.remove(0);
            } else if c == '-' {
                self.op = StoreOp::Remove;
                item.remove(0);
            }
        }
        if let Some(stripped) = item.strip_suffix(".SILENT") {
            self.silent = true;
            item = stripped.to_owned();
        }
        if item != "FLAGS" {
            return Err(ParseError {
                message: "expected FLAGS".to_owned(),
            });
        }

        p.space()?;
        let parenthesised = p.next_char() == Some(b'(');
        if parenthesised {
            p.require("(")?;
        }
        loop {
            if parenthesised && p.next_char() == Some(b')') {
                break;
            }
            self.flags.push(p.flag()?);
            if p.next_char() == Some(b' ') {
                p.step();
            } else {
                break;
            }
        }
        if parenthesised {
            p.require(")")?;
        }
        p.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SearchKey {
    All,
    Seen,
    Unseen,
    Deleted,
    Undeleted,
    Flagged,
    Unflagged,
    Answered,
    Unanswered,
    Draft,
    Undraft,
    Recent,
}

#[derive(Default)]
struct SearchCmd {
    keys: Vec<SearchKey>,
    uid_set: Option<SequenceSet>,
    msn_set: Option<SequenceSet>,
    scan: Option<Query>,
}

impl SearchCmd {
    fn parse(&mut self, p: &mut Parser) -> Result<(), ParseError> {
        loop {
            p.space()?;
            if p.next_char().is_some_and(|c| c.is_ascii_digit() || c == b'*')
            {
                self.msn_set = Some(p.sequence_set()?);
            } else {
                let word = p.atom()?.to_ascii_uppercase();
                match word.as_str() {
                    "ALL" => self.keys.push(SearchKey::All),
                    "SEEN" => self.keys.push(SearchKey::Seen),
                    "UNSEEN" => self.keys.push(SearchKey::Unseen),
                    "DELETED" => self.keys.push(SearchKey::Deleted),
                    "UNDELETED" => self.keys.push(SearchKey::Undeleted),
                    "FLAGGED" => self.keys.push(SearchKey::Flagged),
                    "UNFLAGGED" => self.keys.push(SearchKey::Unflagged),
                    "ANSWERED" => self.keys.push(SearchKey::Answered),
                    "UNANSWERED" => self.keys.push(SearchKey::Unanswered),
                    "DRAFT" => self.keys.push(SearchKey::Draft),
                    "UNDRAFT" => self.keys.push(SearchKey::Undraft),
                    "RECENT" => self.keys.push(SearchKey::Recent),
                    "UID" => {
                        p.space()?;
                        self.uid_set = Some(p.sequence_set()?);
                    },
                    _ => {
                        return Err(ParseError {
                            message: format!("unknown search key {word}"),
                        })
                    },
                }
            }
            if p.at_end() {
                return Ok(());
            }
        }
    }

    fn matches(
        &self,
        uid: u32,
        msn: Option<u32>,
        flags: &str,
        mailbox: &SelectedMailbox,
    ) -> bool {
        if let Some(ref set) = self.uid_set {
            let largest = mailbox.msns.last().copied().unwrap_or(0);
            if !set.expand_unclamped(largest).contains(&uid) {
                return false;
            }
        }
        if let Some(ref set) = self.msn_set {
            let Some(msn) = msn else { return false };
            if !set.expand(mailbox.msns.len() as u32).contains(&msn) {
                return false;
            }
        }
        self.keys.iter().all(|&key| {
            let (flag, wanted) = match key {
                SearchKey::All => return true,
                SearchKey::Seen => ("\\Seen", true),
                SearchKey::Unseen => ("\\Seen", false),
                SearchKey::Deleted => ("\\Deleted", true),
                SearchKey::Undeleted => ("\\Deleted", false),
                SearchKey::Flagged => ("\\Flagged", true),
                SearchKey::Unflagged => ("\\Flagged", false),
                SearchKey::Answered => ("\\Answered", true),
                SearchKey::Unanswered => ("\\Answered", false),
                SearchKey::Draft => ("\\Draft", true),
                SearchKey::Undraft => ("\\Draft", false),
                SearchKey::Recent => ("\\Recent", true),
            };
            flags_contain(flags, flag) == wanted
        })
    }
}

#[derive(Default)]
struct IdleCmd {
    started: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_op_application() {
        let old = vec!["\\Seen".to_owned(), "\\Flagged".to_owned()];
        assert_eq!(
            vec!["\\Seen", "\\Flagged", "\\Deleted"],
            StoreOp::Add.apply(&old, &["\\Deleted".to_owned()]),
        );
        assert_eq!(
            vec!["\\Flagged"],
            StoreOp::Remove.apply(&old, &["\\seen".to_owned()]),
        );
        assert_eq!(
            vec!["\\Draft"],
            StoreOp::Replace.apply(&old, &["\\Draft".to_owned()]),
        );
        // Adding a flag that is already present does not duplicate it.
        assert_eq!(
            old.clone(),
            StoreOp::Add.apply(&old, &["\\seen".to_owned()]),
        );
    }

    #[test]
    fn flag_helpers() {
        assert!(flags_contain("\\Seen \\Deleted", "\\deleted"));
        assert!(!flags_contain("\\Seen", "\\Deleted"));
        assert_eq!(
            vec!["\\Seen", "custom"],
            parse_flags(" \\Seen  custom "),
        );
    }

    #[test]
    fn known_commands() {
        assert!(is_known_command("fetch"));
        assert!(is_known_command("idle"));
        assert!(!is_known_command("frob"));
    }
}
