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

//! The FETCH command.
//!
//! FETCH is the most involved command in the server: it parses a rich
//! attribute language, reduces its message set against what the session
//! still knows, may open a CONDSTORE transaction and an implicit \Seen
//! store, acquires whatever message data the attributes require, and
//! trickles out responses for large sets instead of flooding the write
//! buffer.

use std::collections::HashMap;

use chrono::prelude::*;
use log::debug;

use super::command::RespType;
use super::parser::{ParseError, Parser, SequenceSet};
use super::response::ImapResponse;
use super::session::SessionCore;
use crate::db::{Query, Transaction, Value};

fn fail(message: impl Into<String>) -> ParseError {
    ParseError {
        message: message.into(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SectionText {
    Full,
    Header,
    HeaderFields { fields: Vec<String>, negate: bool },
    Text,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Section {
    binary: bool,
    peek: bool,
    part: Vec<u32>,
    text: SectionText,
    partial: Option<(u32, u32)>,
}

impl Section {
    /// The attribute name echoed in the response, e.g. `BODY[TEXT]<0>`.
    fn response_name(&self) -> String {
        let mut name = String::from(if self.binary { "BINARY[" } else { "BODY[" });
        let mut dotted = self
            .part
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(".");
        let text = match self.text {
            SectionText::Full => String::new(),
            SectionText::Header => "HEADER".to_owned(),
            SectionText::HeaderFields { ref fields, negate } => format!(
                "HEADER.FIELDS{} ({})",
                if negate { ".NOT" } else { "" },
                fields.join(" "),
            ),
            SectionText::Text => "TEXT".to_owned(),
        };
        if !dotted.is_empty() && !text.is_empty() {
            dotted.push('.');
        }
        name.push_str(&dotted);
        name.push_str(&text);
        name.push(']');
        if let Some((offset, _)) = self.partial {
            name.push_str(&format!("<{offset}>"));
        }
        name
    }
}

#[derive(Clone, Debug)]
struct AnnotationSpec {
    entries: Vec<String>,
    attribs: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    NotStarted,
    CondStore,
    Acquire,
    Trickle,
    Commit,
}

enum Acquired {
    Pending,
    Failed((RespType, String)),
    Ready,
}

#[derive(Default)]
struct MessageData {
    flags: String,
    modseq: u64,
    internaldate: i64,
    size: u32,
    header: Option<String>,
    body: Option<String>,
    annotations: Vec<(String, String)>,
}

pub struct Fetch {
    set: Option<SequenceSet>,
    flags_wanted: bool,
    envelope: bool,
    body_summary: bool,
    bodystructure: bool,
    internaldate: bool,
    rfc822_size: bool,
    modseq_wanted: bool,
    uid_attr: bool,
    sections: Vec<Section>,
    annotations: Vec<AnnotationSpec>,
    changed_since: Option<u64>,

    needs_header: bool,
    needs_body: bool,

    phase: Phase,
    uids: Vec<u32>,
    expunged: Vec<u32>,
    condstore_tx: Option<Transaction>,
    condstore_query: Option<Query>,
    seen_store: Option<Query>,
    trivia_query: Option<Query>,
    header_query: Option<Query>,
    body_query: Option<Query>,
    annotation_query: Option<Query>,
    cache: HashMap<u32, MessageData>,
    backlog: Vec<u32>,
    batch: usize,
}

impl Default for Fetch {
    fn default() -> Self {
        Fetch {
            set: None,
            flags_wanted: false,
            envelope: false,
            body_summary: false,
            bodystructure: false,
            internaldate: false,
            rfc822_size: false,
            modseq_wanted: false,
            uid_attr: false,
            sections: Vec::new(),
            annotations: Vec::new(),
            changed_since: None,
            needs_header: false,
            needs_body: false,
            phase: Phase::NotStarted,
            uids: Vec::new(),
            expunged: Vec::new(),
            condstore_tx: None,
            condstore_query: None,
            seen_store: None,
            trivia_query: None,
            header_query: None,
            body_query: None,
            annotation_query: None,
            cache: HashMap::new(),
            backlog: Vec::new(),
            batch: 0,
        }
    }
}

impl Fetch {
    pub fn parse(
        &mut self,
        p: &mut Parser,
        _uid: bool,
        _core: &mut SessionCore,
    ) -> Result<(), ParseError> {
        p.space()?;
        self.set = Some(p.sequence_set()?);
        p.space()?;

        if p.next_char() == Some(b'(') {
            p.require("(")?;
            loop {
                self.parse_attribute(p)?;
                if p.next_char() == Some(b' ') {
                    p.step();
                } else {
                    break;
                }
            }
            p.require(")")?;
        } else {
            self.parse_attribute(p)?;
        }

        if !p.at_end() {
            p.require(" (")?;
            let word = p.atom()?.to_ascii_uppercase();
            if word != "CHANGEDSINCE" {
                return Err(fail("expected CHANGEDSINCE"));
            }
            p.space()?;
            self.changed_since = Some(u64::from(p.number()?));
            self.modseq_wanted = true;
            p.require(")")?;
        }
        p.end()?;

        self.needs_header = self.envelope
            || self.body_summary
            || self.bodystructure
            || self.sections.iter().any(|s| {
                !s.part.is_empty() || s.text != SectionText::Text
            });
        self.needs_body = self.body_summary
            || self.bodystructure
            || self.sections.iter().any(|s| {
                !s.part.is_empty()
                    || matches!(
                        s.text,
                        SectionText::Full | SectionText::Text,
                    )
            });

        Ok(())
    }

    fn parse_attribute(&mut self, p: &mut Parser) -> Result<(), ParseError> {
        let word = p.atom()?.to_ascii_uppercase();
        match word.as_str() {
            // Macros
            "ALL" => {
                self.flags_wanted = true;
                self.internaldate = true;
                self.rfc822_size = true;
                self.envelope = true;
            },
            "FULL" => {
                self.flags_wanted = true;
                self.internaldate = true;
                self.rfc822_size = true;
                self.envelope = true;
                self.body_summary = true;
            },
            "FAST" => {
                self.flags_wanted = true;
                self.internaldate = true;
                self.rfc822_size = true;
            },

            "FLAGS" => self.flags_wanted = true,
            "ENVELOPE" => self.envelope = true,
            "INTERNALDATE" => self.internaldate = true,
            "RFC822.SIZE" => self.rfc822_size = true,
            "UID" => self.uid_attr = true,
            "MODSEQ" => self.modseq_wanted = true,
            "BODYSTRUCTURE" => self.bodystructure = true,
            "RFC822" => self.sections.push(Section {
                binary: false,
                peek: false,
                part: Vec::new(),
                text: SectionText::Full,
                partial: None,
            }),
            "RFC822.HEADER" => self.sections.push(Section {
                binary: false,
                peek: true,
                part: Vec::new(),
                text: SectionText::Header,
                partial: None,
            }),
            "RFC822.TEXT" => self.sections.push(Section {
                binary: false,
                peek: false,
                part: Vec::new(),
                text: SectionText::Text,
                partial: None,
            }),
            "BODY" => {
                if p.next_char() == Some(b'[') {
                    let section = self.parse_section(p, false, false)?;
                    self.sections.push(section);
                } else {
                    self.body_summary = true;
                }
            },
            "BODY.PEEK" => {
                let section = self.parse_section(p, true, false)?;
                self.sections.push(section);
            },
            "BINARY" => {
                let section = self.parse_section(p, false, true)?;
                self.sections.push(section);
            },
            "BINARY.PEEK" => {
                let section = self.parse_section(p, true, true)?;
                self.sections.push(section);
            },
            "ANNOTATION" => {
                p.space()?;
                let spec = self.parse_annotation(p)?;
                self.annotations.push(spec);
            },
            _ => return Err(fail(format!("unknown fetch attribute {word}"))),
        }
        Ok(())
    }

    fn parse_section(
        &mut self,
        p: &mut Parser,
        peek: bool,
        binary: bool,
    ) -> Result<Section, ParseError> {
        p.require("[")?;
        let mut part = Vec::new();
        let mut text = SectionText::Full;

        while p.next_char().is_some_and(|c| c.is_ascii_digit()) {
            part.push(p.nz_number()?);
            if p.next_char() == Some(b'.') {
                p.step();
            } else {
                break;
            }
        }

        if p.next_char() != Some(b']') {
            let word = p.atom()?.to_ascii_uppercase();
            text = match word.as_str() {
                "HEADER" => SectionText::Header,
                "TEXT" => SectionText::Text,
                "HEADER.FIELDS" | "HEADER.FIELDS.NOT" => {
                    let negate = word.ends_with(".NOT");
                    p.require(" (")?;
                    let mut fields = Vec::new();
                    loop {
                        let field = String::from_utf8_lossy(&p.astring()?)
                            .to_ascii_uppercase();
                        fields.push(field);
                        if p.next_char() == Some(b' ') {
                            p.step();
                        } else {
                            break;
                        }
                    }
                    p.require(")")?;
                    SectionText::HeaderFields { fields, negate }
                },
                "MIME" if !part.is_empty() => SectionText::Header,
                _ => return Err(fail(format!("bad section {word}"))),
            };
        }
        p.require("]")?;

        let mut partial = None;
        if p.next_char() == Some(b'<') {
            p.require("<")?;
            let offset = p.number()?;
            p.require(".")?;
            let length = p.nz_number()?;
            p.require(">")?;
            partial = Some((offset, length));
        }

        Ok(Section {
            binary,
            peek,
            part,
            text,
            partial,
        })
    }

    fn parse_annotation(
        &mut self,
        p: &mut Parser,
    ) -> Result<AnnotationSpec, ParseError> {
        let mut entries = Vec::new();
        if p.next_char() == Some(b'(') {
            p.require("(")?;
            loop {
                entries.push(
                    String::from_utf8_lossy(&p.astring()?).into_owned(),
                );
                if p.next_char() == Some(b' ') {
                    p.step();
                } else {
                    break;
                }
            }
            p.require(")")?;
        } else {
            entries
                .push(String::from_utf8_lossy(&p.astring()?).into_owned());
        }

        p.space()?;
        let mut attribs = Vec::new();
        if p.next_char() == Some(b'(') {
            p.require("(")?;
            loop {
                attribs.push(
                    String::from_utf8_lossy(&p.astring()?).into_owned(),
                );
                if p.next_char() == Some(b' ') {
                    p.step();
                } else {
                    break;
                }
            }
            p.require(")")?;
        } else {
            attribs
                .push(String::from_utf8_lossy(&p.astring()?).into_owned());
        }

        Ok(AnnotationSpec { entries, attribs })
    }

    /// One scheduler step. Returns the tagged response when done.
    pub fn step(
        &mut self,
        uid_cmd: bool,
        core: &mut SessionCore,
    ) -> Option<(RespType, String)> {
        let Some(mailbox) = core.mailbox.as_ref() else {
            return Some((RespType::No, "No mailbox selected".to_owned()));
        };
        let mailbox_id = mailbox.id;
        let writable = !mailbox.read_only;
        let largest_uid = mailbox.msns.last().copied().unwrap_or(0);
        let uidnext = mailbox.uidnext;

        if self.phase == Phase::NotStarted {
            // Resolve the message set against the session's view, and
            // note UIDs the client asked for which have been expunged.
            let set = self.set.as_ref().expect("parsed fetch has a set");
            let requested = if uid_cmd {
                set.expand_unclamped(largest_uid)
            } else {
                let count = mailbox.msns.len() as u32;
                set.expand(count)
                    .into_iter()
                    .filter_map(|msn| {
                        mailbox.msns.get(msn as usize - 1).copied()
                    })
                    .collect()
            };

            for &uid in &requested {
                if mailbox.msns.contains(&uid) {
                    self.uids.push(uid);
                } else if uid_cmd && uid < uidnext {
                    self.expunged.push(uid);
                }
            }

            self.phase = if self.changed_since.is_some() {
                Phase::CondStore
            } else {
                Phase::Acquire
            };
        }

        if self.phase == Phase::CondStore {
            let Some(ref query) = self.condstore_query else {
                let tx = core.transaction();
                let query = Query::new(
                    "select uid from mailbox_messages \
                     where mailbox=$1 and modseq>$2 and uid=any($3) \
                     for update",
                    vec![
                        Value::Int(mailbox_id),
                        Value::Int(self.changed_since.unwrap() as i64),
                        Value::IntSet(
                            self.uids.iter().map(|&u| i64::from(u)).collect(),
                        ),
                    ],
                );
                tx.enqueue(&query);
                tx.execute(&core.waker);
                self.condstore_tx = Some(tx);
                self.condstore_query = Some(query);
                return None;
            };

            if !query.done() {
                return None;
            }
            if query.failed() {
                self.condstore_tx.as_ref().unwrap().rollback();
                return Some((RespType::No, "Database error".to_owned()));
            }

            let mut changed = Vec::new();
            while let Some(row) = query.next_row() {
                changed.push(row.get_int("uid") as u32);
            }
            self.uids.retain(|u| changed.contains(u));
            self.phase = Phase::Acquire;
        }

        if self.phase == Phase::Acquire {
            if self.uids.is_empty() {
                self.phase = Phase::Commit;
            } else {
                match self.acquire(core, mailbox_id, writable) {
                    Acquired::Pending => return None,
                    Acquired::Failed(response) => return Some(response),
                    Acquired::Ready => {},
                }
            }
        }

        if self.phase == Phase::Trickle {
            self.trickle(core, uid_cmd);
            if !self.backlog.is_empty() {
                core.request_wake(std::time::Duration::from_secs(1));
                return None;
            }
            self.phase = Phase::Commit;
        }

        if self.phase == Phase::Commit {
            if let Some(ref tx) = self.condstore_tx {
                if !tx.done() {
                    tx.commit(&core.waker);
                    return None;
                }
            }

            if !self.expunged.is_empty() {
                let list = self
                    .expunged
                    .iter()
                    .map(|u| u.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                return Some((
                    RespType::No,
                    format!("Some requested messages were expunged: {list}"),
                ));
            }
            return Some((RespType::Ok, "done".to_owned()));
        }

        None
    }

    /// Registers any fetchers not yet running, and moves on to the
    /// trickle once every registered fetcher has delivered.
    fn acquire(
        &mut self,
        core: &mut SessionCore,
        mailbox_id: i64,
        writable: bool,
    ) -> Acquired {
        let uid_set = Value::IntSet(
            self.uids.iter().map(|&u| i64::from(u)).collect(),
        );

        // An un-peeked body fetch sets \Seen before any data is read.
        let implicit_seen =
            self.sections.iter().any(|s| !s.peek) && writable;
        if implicit_seen && self.seen_store.is_none() {
            let query = Query::new(
                "update mailbox_messages \
                 set flags=trim(flags || ' \\Seen') \
                 where mailbox=$1 and uid=any($2) \
                 and not flags like '%\\Seen%'",
                vec![Value::Int(mailbox_id), uid_set.clone()],
            );
            core.execute(&query);
            self.seen_store = Some(query);
        }

        if self.trivia_query.is_none() {
            let query = Query::new(
                "select uid, flags, modseq, \
                 extract(epoch from idate)::bigint as internaldate, \
                 rfc822size from mailbox_messages \
                 where mailbox=$1 and uid=any($2)",
                vec![Value::Int(mailbox_id), uid_set.clone()],
            );
            core.execute(&query);
            self.trivia_query = Some(query);
        }

        if self.needs_header && self.header_query.is_none() {
            let query = Query::new(
                "select mm.uid, m.header from mailbox_messages mm \
                 join messages m on (mm.message=m.id) \
                 where mm.mailbox=$1 and mm.uid=any($2)",
                vec![Value::Int(mailbox_id), uid_set.clone()],
            );
            core.execute(&query);
            self.header_query = Some(query);
        }

        if self.needs_body && self.body_query.is_none() {
            let query = Query::new(
                "select mm.uid, m.body from mailbox_messages mm \
                 join messages m on (mm.message=m.id) \
                 where mm.mailbox=$1 and mm.uid=any($2)",
                vec![Value::Int(mailbox_id), uid_set.clone()],
            );
            core.execute(&query);
            self.body_query = Some(query);
        }

        if !self.annotations.is_empty() && self.annotation_query.is_none() {
            let query = Query::new(
                "select uid, name, value from annotations \
                 where mailbox=$1 and uid=any($2)",
                vec![Value::Int(mailbox_id), uid_set],
            );
            core.execute(&query);
            self.annotation_query = Some(query);
        }

        let pending = [
            &self.seen_store,
            &self.trivia_query,
            &self.header_query,
            &self.body_query,
            &self.annotation_query,
        ];
        if pending.iter().any(|q| q.as_ref().is_some_and(|q| !q.done())) {
            return Acquired::Pending;
        }
        if pending.iter().any(|q| q.as_ref().is_some_and(|q| q.failed())) {
            if let Some(ref tx) = self.condstore_tx {
                tx.rollback();
            }
            return Acquired::Failed((
                RespType::No,
                "Database error".to_owned(),
            ));
        }

        // Everything arrived; index it by UID.
        if let Some(ref q) = self.trivia_query {
            while let Some(row) = q.next_row() {
                let uid = row.get_int("uid") as u32;
                let data = self.cache.entry(uid).or_default();
                data.flags = row.get_text("flags").to_owned();
                data.modseq = row.get_int("modseq") as u64;
                data.internaldate = row.get_int("internaldate");
                data.size = row.get_int("rfc822size") as u32;
            }
        }
        if let Some(ref q) = self.header_query {
            while let Some(row) = q.next_row() {
                let uid = row.get_int("uid") as u32;
                self.cache.entry(uid).or_default().header =
                    Some(row.get_text("header").to_owned());
            }
        }
        if let Some(ref q) = self.body_query {
            while let Some(row) = q.next_row() {
                let uid = row.get_int("uid") as u32;
                self.cache.entry(uid).or_default().body =
                    Some(row.get_text("body").to_owned());
            }
        }
        if let Some(ref q) = self.annotation_query {
            while let Some(row) = q.next_row() {
                let uid = row.get_int("uid") as u32;
                self.cache.entry(uid).or_default().annotations.push((
                    row.get_text("name").to_owned(),
                    row.get_text("value").to_owned(),
                ));
            }
        }

        self.backlog = self
            .uids
            .iter()
            .copied()
            .filter(|u| self.cache.contains_key(u))
            .collect();
        // Pace the output so a huge fetch drains within a minute and a
        // half rather than swamping the write buffer in one go.
        self.batch = (self.backlog.len() + 89) / 90;
        debug!(
            "{} Fetch data complete for {} messages",
            core.log_prefix,
            self.backlog.len(),
        );
        self.phase = Phase::Trickle;
        Acquired::Ready
    }

    /// Emits one batch of responses.
    fn trickle(&mut self, core: &mut SessionCore, uid_cmd: bool) {
        let n = if self.backlog.len() <= 90 {
            self.backlog.len()
        } else {
            self.batch.max(1)
        };

        let batch: Vec<u32> =
            self.backlog.drain(..n.min(self.backlog.len())).collect();
        for uid in batch {
            let Some(data) = self.cache.get(&uid) else { continue };
            let attrs = self.render_attrs(uid, data, uid_cmd, core);
            core.respond(ImapResponse::fetch(uid, attrs));
        }
    }

    fn render_attrs(
        &self,
        uid: u32,
        data: &MessageData,
        uid_cmd: bool,
        core: &SessionCore,
    ) -> String {
        let mut attrs = Vec::<String>::new();

        if self.flags_wanted || self.sections.iter().any(|s| !s.peek) {
            attrs.push(format!("FLAGS ({})", data.flags.trim()));
        }
        if uid_cmd || self.uid_attr {
            attrs.push(format!("UID {uid}"));
        }
        if self.internaldate {
            let date = Utc
                .timestamp_opt(data.internaldate, 0)
                .single()
                .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
            attrs.push(format!(
                "INTERNALDATE \"{}\"",
                date.format("%d-%b-%Y %H:%M:%S +0000"),
            ));
        }
        if self.rfc822_size {
            attrs.push(format!("RFC822.SIZE {}", data.size));
        }
        if self.modseq_wanted || core.capabilities.condstore {
            attrs.push(format!("MODSEQ ({})", data.modseq));
        }
        if self.envelope {
            let header = data.header.as_deref().unwrap_or("");
            attrs.push(format!("ENVELOPE {}", envelope(header)));
        }
        if self.body_summary || self.bodystructure {
            let structure = BodyStructure::from_message(
                data.header.as_deref().unwrap_or(""),
                data.body.as_deref().unwrap_or(""),
            );
            if self.bodystructure {
                attrs.push(format!(
                    "BODYSTRUCTURE {}",
                    structure.write(true),
                ));
            }
            if self.body_summary {
                attrs.push(format!("BODY {}", structure.write(false)));
            }
        }
        for section in &self.sections {
            let content = section_content(
                section,
                data.header.as_deref().unwrap_or(""),
                data.body.as_deref().unwrap_or(""),
            );
            let content = match section.partial {
                Some((offset, length)) => {
                    let start = (offset as usize).min(content.len());
                    let end =
                        (start + length as usize).min(content.len());
                    content[start..end].to_owned()
                },
                None => content,
            };
            attrs.push(format!(
                "{} {}",
                section.response_name(),
                literal(&content),
            ));
        }
        for spec in &self.annotations {
            let mut entries = Vec::new();
            for (entry, value) in &data.annotations {
                if spec
                    .entries
                    .iter()
                    .any(|pattern| annotation_matches(pattern, entry))
                {
                    let mut pairs = Vec::new();
                    for attrib in &spec.attribs {
                        if attrib == "value"
                            || attrib == "value.priv"
                            || attrib == "value.shared"
                        {
                            pairs.push(format!(
                                "{:?} {}",
                                attrib.as_str(),
                                quoted(value),
                            ));
                        }
                    }
                    entries.push(format!(
                        "{} ({})",
                        quoted(entry),
                        pairs.join(" "),
                    ));
                }
            }
            attrs.push(format!("ANNOTATION ({})", entries.join(" ")));
        }

        attrs.join(" ")
    }
}

/// Renders `s` as an IMAP literal.
fn literal(s: &str) -> String {
    format!("{{{}}}\r\n{}", s.len(), s)
}

/// Renders `s` as a quoted string.
fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn quoted_nstring(s: Option<&str>) -> String {
    match s {
        None => "NIL".to_owned(),
        Some(s) => quoted(s),
    }
}

/// Extracts the content a section specifier names from a message.
fn section_content(section: &Section, header: &str, body: &str) -> String {
    let (header, body) = drill_down(&section.part, header, body);

    match section.text {
        SectionText::Full => format!("{header}\r\n{body}"),
        SectionText::Text => body,
        SectionText::Header => format!("{header}\r\n"),
        SectionText::HeaderFields { ref fields, negate } => {
            let mut out = String::new();
            for (name, value) in header_fields(&header) {
                let listed = fields
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(&name));
                if listed != negate {
                    out.push_str(&format!("{name}: {value}\r\n"));
                }
            }
            out.push_str("\r\n");
            out
        },
    }
}

/// Walks a dotted part path through nested multiparts.
fn drill_down(
    part: &[u32],
    header: &str,
    body: &str,
) -> (String, String) {
    let mut header = header.to_owned();
    let mut body = body.to_owned();

    for &ix in part {
        let boundary = content_type_parameter(&header, "boundary");
        let Some(boundary) = boundary else {
            // A part number on a non-multipart names the message itself
            // for part 1.
            continue;
        };
        let parts = split_multipart(&body, &boundary);
        let Some(part_text) = parts.get(ix as usize - 1) else {
            return (String::new(), String::new());
        };
        let (h, b) = split_message_text(part_text);
        header = h;
        body = b;
    }

    (header, body)
}

/// Splits a message into (header, body) at the first blank line.
fn split_message_text(text: &str) -> (String, String) {
    if let Some(ix) = text.find("\r\n\r\n") {
        (text[..ix].to_owned(), text[ix + 4..].to_owned())
    } else if let Some(ix) = text.find("\n\n") {
        (text[..ix].to_owned(), text[ix + 2..].to_owned())
    } else {
        (text.to_owned(), String::new())
    }
}

/// The unfolded header fields of a header block, in order.
fn header_fields(header: &str) -> Vec<(String, String)> {
    let mut out = Vec::<(String, String)>::new();
    for line in header.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = out.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim_start());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            out.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }
    out
}

fn header_field(header: &str, name: &str) -> Option<String> {
    header_fields(header)
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn content_type_parameter(header: &str, parameter: &str) -> Option<String> {
    let content_type = header_field(header, "Content-Type")?;
    for piece in content_type.split(';').skip(1) {
        let piece = piece.trim();
        if let Some((name, value)) = piece.split_once('=') {
            if name.trim().eq_ignore_ascii_case(parameter) {
                return Some(
                    value.trim().trim_matches('"').to_owned(),
                );
            }
        }
    }
    None
}

fn split_multipart(body: &str, boundary: &str) -> Vec<String> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut current: Option<String> = None;

    for line in body.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == delimiter {
            if let Some(part) = current.take() {
                parts.push(trim_trailing_crlf(part));
            }
            current = Some(String::new());
        } else if trimmed == format!("{delimiter}--") {
            if let Some(part) = current.take() {
                parts.push(trim_trailing_crlf(part));
            }
            break;
        } else if let Some(ref mut part) = current {
            part.push_str(line);
        }
    }

    if let Some(part) = current {
        parts.push(trim_trailing_crlf(part));
    }
    parts
}

fn trim_trailing_crlf(mut s: String) -> String {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
    s
}

/// Renders the RFC 3501 ENVELOPE for a header block.
pub fn envelope(header: &str) -> String {
    let date = header_field(header, "Date");
    let subject = header_field(header, "Subject");
    let from = address_list(header, "From");
    let sender = address_list(header, "Sender").or_else(|| from.clone());
    let reply_to =
        address_list(header, "Reply-To").or_else(|| from.clone());
    let to = address_list(header, "To");
    let cc = address_list(header, "Cc");
    let bcc = address_list(header, "Bcc");
    let in_reply_to = header_field(header, "In-Reply-To");
    let message_id = header_field(header, "Message-Id");

    let render_list = |list: Option<Vec<ParsedAddress>>| match list {
        None => "NIL".to_owned(),
        Some(list) if list.is_empty() => "NIL".to_owned(),
        Some(list) => {
            let mut out = String::from("(");
            for a in list {
                out.push_str(&format!(
                    "({} NIL {} {})",
                    quoted_nstring(a.name.as_deref()),
                    quoted_nstring(Some(&a.localpart)),
                    quoted_nstring(Some(&a.domain)),
                ));
            }
            out.push(')');
            out
        },
    };

    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        quoted_nstring(date.as_deref()),
        quoted_nstring(subject.as_deref()),
        render_list(from.clone()),
        render_list(sender),
        render_list(reply_to),
        render_list(to),
        render_list(cc),
        render_list(bcc),
        quoted_nstring(in_reply_to.as_deref()),
        quoted_nstring(message_id.as_deref()),
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ParsedAddress {
    name: Option<String>,
    localpart: String,
    domain: String,
}

fn address_list(header: &str, field: &str) -> Option<Vec<ParsedAddress>> {
    let value = header_field(header, field)?;
    let mut out = Vec::new();
    for piece in value.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if let Some(address) = parse_address(piece) {
            out.push(address);
        }
    }
    Some(out)
}

fn parse_address(s: &str) -> Option<ParsedAddress> {
    let (name, addr) = match (s.find('<'), s.find('>')) {
        (Some(lt), Some(gt)) if lt < gt => {
            let name = s[..lt].trim().trim_matches('"').trim();
            let name = if name.is_empty() {
                None
            } else {
                Some(name.to_owned())
            };
            (name, &s[lt + 1..gt])
        },
        _ => (None, s),
    };
    let (localpart, domain) = addr.trim().rsplit_once('@')?;
    Some(ParsedAddress {
        name,
        localpart: localpart.to_owned(),
        domain: domain.to_owned(),
    })
}

/// The MIME skeleton of a message, as far as BODY and BODYSTRUCTURE
/// responses need it: text and multipart nodes with their size
/// bookkeeping. Decoding is somebody else's business.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BodyStructure {
    pub content_type: String,
    pub subtype: String,
    pub params: Vec<(String, String)>,
    pub encoding: String,
    pub size: u32,
    pub lines: Option<u32>,
    pub children: Vec<BodyStructure>,
}

impl BodyStructure {
    pub fn from_message(header: &str, body: &str) -> Self {
        let content_type = header_field(header, "Content-Type")
            .unwrap_or_else(|| "text/plain; charset=us-ascii".to_owned());
        let mut type_iter =
            content_type.split(';').next().unwrap_or("").splitn(2, '/');
        let primary = type_iter
            .next()
            .unwrap_or("text")
            .trim()
            .to_ascii_uppercase();
        let subtype = type_iter
            .next()
            .unwrap_or("PLAIN")
            .trim()
            .to_ascii_uppercase();

        if primary == "MULTIPART" {
            let boundary = content_type_parameter(header, "boundary")
                .unwrap_or_default();
            let children = split_multipart(body, &boundary)
                .into_iter()
                .map(|part| {
                    let (h, b) = split_message_text(&part);
                    BodyStructure::from_message(&h, &b)
                })
                .collect();
            return BodyStructure {
                content_type: primary,
                subtype,
                params: vec![("BOUNDARY".to_owned(), boundary)],
                encoding: String::new(),
                size: 0,
                lines: None,
                children,
            };
        }

        let params = content_type
            .split(';')
            .skip(1)
            .filter_map(|piece| {
                let (name, value) = piece.trim().split_once('=')?;
                Some((
                    name.trim().to_ascii_uppercase(),
                    value.trim().trim_matches('"').to_owned(),
                ))
            })
            .collect();
        let encoding =
            header_field(header, "Content-Transfer-Encoding")
                .map(|e| e.to_ascii_uppercase())
                .unwrap_or_else(|| "7BIT".to_owned());
        let lines = if primary == "TEXT" {
            Some(body.lines().count() as u32)
        } else {
            None
        };

        BodyStructure {
            content_type: primary,
            subtype,
            params,
            encoding,
            size: body.len() as u32,
            lines,
            children: Vec::new(),
        }
    }

    /// Serialises per the RFC 3501 body ABNF. `extended` adds the
    /// parameter list on multiparts (BODYSTRUCTURE); the non-extended
    /// form is used for the BODY attribute.
    pub fn write(&self, extended: bool) -> String {
        if self.content_type == "MULTIPART" {
            let mut out = String::from("(");
            for child in &self.children {
                out.push_str(&child.write(extended));
            }
            out.push(' ');
            out.push_str(&quoted(&self.subtype));
            if extended {
                out.push(' ');
                out.push_str(&write_params(&self.params));
            }
            out.push(')');
            return out;
        }

        let mut out = format!(
            "({} {} {} NIL NIL {} {}",
            quoted(&self.content_type),
            quoted(&self.subtype),
            write_params(&self.params),
            quoted(&self.encoding),
            self.size,
        );
        if let Some(lines) = self.lines {
            out.push_str(&format!(" {lines}"));
        }
        out.push(')');
        out
    }
}

fn write_params(params: &[(String, String)]) -> String {
    if params.is_empty() {
        return "NIL".to_owned();
    }
    let mut out = String::from("(");
    for (ix, (name, value)) in params.iter().enumerate() {
        if ix > 0 {
            out.push(' ');
        }
        out.push_str(&quoted(name));
        out.push(' ');
        out.push_str(&quoted(value));
    }
    out.push(')');
    out
}

/// Matches an annotation entry against a `%`/`*` pattern with mailbox
/// wildcard semantics: `*` crosses hierarchy separators, `%` does not.
pub fn annotation_matches(pattern: &str, entry: &str) -> bool {
    fn matches(p: &[u8], e: &[u8]) -> bool {
        match (p.first(), e.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(b'*'), _) => {
                matches(&p[1..], e)
                    || (!e.is_empty() && matches(p, &e[1..]))
            },
            (Some(b'%'), _) => {
                matches(&p[1..], e)
                    || (e.first().is_some_and(|&c| c != b'/')
                        && matches(p, &e[1..]))
            },
            (Some(_), None) => false,
            (Some(&a), Some(&b)) => a == b && matches(&p[1..], &e[1..]),
        }
    }
    matches(pattern.as_bytes(), entry.as_bytes())
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn parse_fetch(text: &str) -> Result<Fetch, ParseError> {
        let mut fetch = Fetch::default();
        let mut parser = Parser::new(text.as_bytes().to_vec());
        // A throwaway core just for parsing.
        let (pool, _rx) = crate::db::Pool::new();
        let (waker, _woken) = tokio::sync::mpsc::unbounded_channel();
        let config = std::rc::Rc::new(
            crate::support::system_config::SystemConfig::load(
                "hostname = \"h\"\nsmart-host-address = \"127.0.0.1\"\n",
            )
            .unwrap(),
        );
        let mut core = SessionCore::new(
            pool,
            config,
            crate::support::log_prefix::LogPrefix::new(
                "imap".to_owned(),
                1,
            ),
            waker,
        );
        fetch.parse(&mut parser, false, &mut core)?;
        Ok(fetch)
    }

    #[test]
    fn parse_macros_and_attributes() {
        let fetch = parse_fetch(" 1:4 ALL").unwrap();
        assert!(fetch.flags_wanted);
        assert!(fetch.envelope);
        assert!(fetch.internaldate);
        assert!(fetch.rfc822_size);
        assert!(!fetch.body_summary);
        assert!(fetch.needs_header);
        assert!(!fetch.needs_body);

        let fetch = parse_fetch(" 1 (FLAGS UID MODSEQ)").unwrap();
        assert!(fetch.flags_wanted && fetch.uid_attr);
        assert!(!fetch.needs_header && !fetch.needs_body);

        let fetch =
            parse_fetch(" 1 (BODY.PEEK[HEADER.FIELDS (From Subject)])")
                .unwrap();
        assert_eq!(1, fetch.sections.len());
        assert!(fetch.sections[0].peek);
        assert!(fetch.needs_header);

        let fetch = parse_fetch(" 1 BODY[1.2.TEXT]<10.200>").unwrap();
        assert_eq!(vec![1, 2], fetch.sections[0].part);
        assert_eq!(Some((10, 200)), fetch.sections[0].partial);
        assert!(fetch.needs_body);

        let fetch = parse_fetch(" 1:* (FLAGS) (CHANGEDSINCE 42)").unwrap();
        assert_eq!(Some(42), fetch.changed_since);
        assert!(fetch.modseq_wanted);

        assert!(parse_fetch(" 1 (WHAT)").is_err());
        assert!(parse_fetch(" 1").is_err());
    }

    #[test]
    fn section_names_echo_partial_offset() {
        let fetch = parse_fetch(" 1 BODY[TEXT]<10.200>").unwrap();
        assert_eq!("BODY[TEXT]<10>", fetch.sections[0].response_name());

        let fetch = parse_fetch(" 1 BODY.PEEK[2.HEADER]").unwrap();
        assert_eq!("BODY[2.HEADER]", fetch.sections[0].response_name());
    }

    #[test]
    fn envelope_rendering() {
        let header = "Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
                      Subject: Hi there\r\n\
                      From: Zim <zim@earth.com>\r\n\
                      To: tallest@irk.com, \"Gir\" <gir@irk.com>\r\n\
                      Message-Id: <m1@earth.com>\r\n";
        let envelope = envelope(header);
        assert!(envelope.starts_with(
            "(\"Mon, 1 Jan 2024 00:00:00 +0000\" \"Hi there\" \
             ((\"Zim\" NIL \"zim\" \"earth.com\"))",
        ));
        assert!(envelope.contains(
            "((NIL NIL \"tallest\" \"irk.com\")(\"Gir\" NIL \"gir\" \
             \"irk.com\"))",
        ));
        assert!(envelope.ends_with("NIL \"<m1@earth.com>\")"));
    }

    #[test]
    fn header_unfolding() {
        let fields = header_fields(
            "Subject: a long\r\n subject line\r\nFrom: x@y\r\n",
        );
        assert_eq!(
            vec![
                ("Subject".to_owned(), "a long subject line".to_owned()),
                ("From".to_owned(), "x@y".to_owned()),
            ],
            fields,
        );
    }

    #[test]
    fn simple_bodystructure() {
        let s = BodyStructure::from_message(
            "Content-Type: text/plain; charset=utf-8\r\n",
            "hello\r\nworld\r\n",
        );
        assert_eq!(
            "(\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \
             \"7BIT\" 14 2)",
            s.write(true),
        );
    }

    #[test]
    fn multipart_bodystructure() {
        let body = "--b1\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    part one\r\n\
                    --b1\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <p>two</p>\r\n\
                    --b1--\r\n";
        let s = BodyStructure::from_message(
            "Content-Type: multipart/alternative; boundary=b1\r\n",
            body,
        );
        assert_eq!(2, s.children.len());
        assert_eq!("PLAIN", s.children[0].subtype);
        assert_eq!("HTML", s.children[1].subtype);
        let written = s.write(true);
        assert!(written.starts_with("((\"TEXT\" \"PLAIN\""));
        assert!(written.contains("\"ALTERNATIVE\" (\"BOUNDARY\" \"b1\")"));
    }

    #[test]
    fn section_extraction() {
        let header = "Content-Type: multipart/mixed; boundary=xyz\r\n\
                      Subject: outer\r\n";
        let body = "--xyz\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    first part\r\n\
                    --xyz\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    second part\r\n\
                    --xyz--\r\n";

        let section = Section {
            binary: false,
            peek: true,
            part: vec![2],
            text: SectionText::Text,
            partial: None,
        };
        assert_eq!("second part", section_content(&section, header, body));

        let section = Section {
            binary: false,
            peek: true,
            part: Vec::new(),
            text: SectionText::HeaderFields {
                fields: vec!["SUBJECT".to_owned()],
                negate: false,
            },
            partial: None,
        };
        assert_eq!(
            "Subject: outer\r\n\r\n",
            section_content(&section, header, body),
        );
    }

    #[test]
    fn annotation_wildcards() {
        assert!(annotation_matches("/comment", "/comment"));
        assert!(annotation_matches("/*", "/vendor/x/comment"));
        assert!(annotation_matches("/%", "/comment"));
        assert!(!annotation_matches("/%", "/vendor/comment"));
        assert!(annotation_matches("/vendor/*", "/vendor/x/y"));
        assert!(!annotation_matches("/vendor/%", "/vendor/x/y"));
        assert!(!annotation_matches("/comment", "/commentary"));
    }

    // The ABNF parser below exists to check that what we serialise can
    // be read back; the server itself never parses body structures.
    fn parse_bodystructure(s: &str) -> (BodyStructure, usize) {
        assert_eq!(Some('('), s.chars().next());
        if s[1..].starts_with('(') {
            // Multipart: children then subtype, maybe params.
            let mut children = Vec::new();
            let mut pos = 1;
            while s[pos..].starts_with('(') {
                let (child, used) = parse_bodystructure(&s[pos..]);
                children.push(child);
                pos += used;
            }
            let rest = &s[pos..];
            let mut tokens = Tokens::new(rest);
            let subtype = tokens.string();
            let params = tokens.maybe_params();
            let end = pos + tokens.pos_after(')');
            (
                BodyStructure {
                    content_type: "MULTIPART".to_owned(),
                    subtype,
                    params,
                    encoding: String::new(),
                    size: 0,
                    lines: None,
                    children,
                },
                end,
            )
        } else {
            let mut tokens = Tokens::new(&s[1..]);
            let content_type = tokens.string();
            let subtype = tokens.string();
            let params = tokens.maybe_params();
            tokens.nil(); // id
            tokens.nil(); // description
            let encoding = tokens.string();
            let size = tokens.number();
            let lines = if content_type == "TEXT" {
                Some(tokens.number())
            } else {
                None
            };
            let end = 1 + tokens.pos_after(')');
            (
                BodyStructure {
                    content_type,
                    subtype,
                    params,
                    encoding,
                    size,
                    lines,
                    children: Vec::new(),
                },
                end,
            )
        }
    }

    struct Tokens<'a> {
        s: &'a str,
        pos: usize,
    }

    impl<'a> Tokens<'a> {
        fn new(s: &'a str) -> Self {
            Tokens { s, pos: 0 }
        }

        fn skip_space(&mut self) {
            while self.s[self.pos..].starts_with(' ') {
                self.pos += 1;
            }
        }

        fn string(&mut self) -> String {
            self.skip_space();
            assert!(self.s[self.pos..].starts_with('"'), "at {:?}", &self.s[self.pos..]);
            self.pos += 1;
            let mut out = String::new();
            let bytes = self.s.as_bytes();
            while bytes[self.pos] != b'"' {
                if bytes[self.pos] == b'\\' {
                    self.pos += 1;
                }
                out.push(bytes[self.pos] as char);
                self.pos += 1;
            }
            self.pos += 1;
            out
        }

        fn number(&mut self) -> u32 {
            self.skip_space();
            let start = self.pos;
            let bytes = self.s.as_bytes();
            while bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
            self.s[start..self.pos].parse().unwrap()
        }

        fn nil(&mut self) {
            self.skip_space();
            assert!(self.s[self.pos..].starts_with("NIL"));
            self.pos += 3;
        }

        fn maybe_params(&mut self) -> Vec<(String, String)> {
            self.skip_space();
            if self.s[self.pos..].starts_with("NIL") {
                self.pos += 3;
                return Vec::new();
            }
            if !self.s[self.pos..].starts_with('(') {
                return Vec::new();
            }
            self.pos += 1;
            let mut out = Vec::new();
            loop {
                self.skip_space();
                if self.s[self.pos..].starts_with(')') {
                    self.pos += 1;
                    return out;
                }
                let name = self.string();
                let value = self.string();
                out.push((name, value));
            }
        }

        fn pos_after(&mut self, c: char) -> usize {
            self.skip_space();
            assert_eq!(Some(c), self.s[self.pos..].chars().next());
            self.pos + 1
        }
    }

    #[test]
    fn bodystructure_round_trip_simple() {
        let original = BodyStructure::from_message(
            "Content-Type: text/plain; charset=utf-8\r\n",
            "body text\r\n",
        );
        let written = original.write(true);
        let (parsed, used) = parse_bodystructure(&written);
        assert_eq!(written.len(), used);
        assert_eq!(original, parsed);
    }

    #[test]
    fn bodystructure_round_trip_nested() {
        let inner = "--in\r\n\
                     Content-Type: text/plain\r\n\
                     \r\n\
                     a\r\n\
                     --in\r\n\
                     Content-Type: text/enriched\r\n\
                     \r\n\
                     b\r\n\
                     --in--\r\n";
        let body = format!(
            "--out\r\n\
             Content-Type: multipart/alternative; boundary=in\r\n\
             \r\n\
             {inner}\
             --out\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             AAAA\r\n\
             --out--\r\n",
        );
        let original = BodyStructure::from_message(
            "Content-Type: multipart/mixed; boundary=out\r\n",
            &body,
        );
        assert_eq!(2, original.children.len());
        assert_eq!(2, original.children[0].children.len());

        let written = original.write(true);
        let (parsed, used) = parse_bodystructure(&written);
        assert_eq!(written.len(), used);
        assert_eq!(original, parsed);
    }

    proptest! {
        #[test]
        fn bodystructure_round_trips(
            subtype in "[A-Z]{1,8}",
            charset in "[a-z0-9-]{1,12}",
            body in "[a-z \r\n]{0,64}",
        ) {
            let header = format!(
                "Content-Type: text/{subtype}; charset={charset}\r\n",
            );
            let original = BodyStructure::from_message(&header, &body);
            let written = original.write(true);
            let (parsed, used) = parse_bodystructure(&written);
            prop_assert_eq!(written.len(), used);
            prop_assert_eq!(original, parsed);
        }
    }
}
