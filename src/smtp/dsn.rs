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

//! The delivery status notification model (RFC 3464): an envelope holding
//! the message being sent, its sender, and the per-recipient outcome of
//! the most recent delivery attempt.
//!
//! A `Dsn` is handed to the outbound SMTP client, which mutates each
//! `Recipient` in place as the smarthost answers; afterwards the delivery
//! agent writes the surviving state back to `delivery_recipients` and, if
//! anything went permanently wrong, renders the bounce report.

use std::fmt::Write as _;
use std::rc::Rc;

use chrono::prelude::*;

/// What has happened to one recipient of one delivery so far.
///
/// The numeric values are stored in `delivery_recipients.action`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum Action {
    Unknown = 0,
    Failed = 1,
    Delayed = 2,
    Delivered = 3,
    Relayed = 4,
    Expanded = 5,
}

impl Action {
    pub fn from_db(v: i64) -> Self {
        match v {
            1 => Action::Failed,
            2 => Action::Delayed,
            3 => Action::Delivered,
            4 => Action::Relayed,
            5 => Action::Expanded,
            _ => Action::Unknown,
        }
    }

    pub fn to_db(self) -> i64 {
        self as i64
    }

    /// True once the action can no longer change: a recipient leaves
    /// Unknown exactly once.
    pub fn is_final(self) -> bool {
        !matches!(self, Action::Unknown)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressType {
    /// localpart@domain
    Normal,
    /// The empty reverse-path, <>
    Bounce,
}

/// An address as stored in the addresses table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub localpart: String,
    pub domain: String,
    pub id: Option<i64>,
}

impl Address {
    pub fn new(localpart: impl Into<String>, domain: impl Into<String>) -> Self {
        Address {
            name: String::new(),
            localpart: localpart.into(),
            domain: domain.into(),
            id: None,
        }
    }

    pub fn bounce() -> Self {
        Address::new("", "")
    }

    pub fn address_type(&self) -> AddressType {
        if self.localpart.is_empty() && self.domain.is_empty() {
            AddressType::Bounce
        } else {
            AddressType::Normal
        }
    }

    /// localpart@domain, or the empty string for the bounce address.
    pub fn lpdomain(&self) -> String {
        match self.address_type() {
            AddressType::Bounce => String::new(),
            AddressType::Normal => {
                format!("{}@{}", self.localpart, self.domain)
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct Recipient {
    pub final_recipient: Address,
    pub last_attempt: Option<DateTime<Utc>>,
    pub action: Action,
    pub status: String,
}

impl Recipient {
    pub fn new(final_recipient: Address) -> Self {
        Recipient {
            final_recipient,
            last_attempt: None,
            action: Action::Unknown,
            status: String::new(),
        }
    }

    pub fn set_action(&mut self, action: Action, status: impl Into<String>) {
        self.action = action;
        self.status = status.into();
    }
}

/// The message payload as it goes on the wire.
///
/// MIME structure is somebody else's problem; the delivery path only needs
/// the serialised bytes and whether they require SMTPUTF8.
#[derive(Clone, Debug)]
pub struct Message {
    pub rfc822: Vec<u8>,
    pub needs_unicode: bool,
    pub message_id: Option<String>,
}

impl Message {
    pub fn new(rfc822: Vec<u8>) -> Self {
        let needs_unicode = rfc822.iter().any(|&b| b >= 0x80);
        Message {
            rfc822,
            needs_unicode,
            message_id: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Dsn {
    pub message: Rc<Message>,
    pub sender: Address,
    pub envelope_id: Option<String>,
    pub recipients: Vec<Recipient>,
}

impl Dsn {
    pub fn new(message: Rc<Message>, sender: Address) -> Self {
        Dsn {
            message,
            sender,
            envelope_id: None,
            recipients: Vec::new(),
        }
    }

    pub fn add_recipient(&mut self, recipient: Recipient) {
        self.recipients.push(recipient);
    }

    /// True while any recipient still has an Unknown action, i.e. there is
    /// still something to attempt.
    pub fn deliveries_pending(&self) -> bool {
        self.recipients
            .iter()
            .any(|r| r.action == Action::Unknown)
    }

    /// True if every recipient ended in a successful action.
    pub fn all_ok(&self) -> bool {
        self.recipients.iter().all(|r| {
            matches!(
                r.action,
                Action::Delivered | Action::Relayed | Action::Expanded,
            )
        })
    }

    /// Renders the bounce report sent back to a Normal sender when the
    /// attempt did not succeed for every recipient.
    pub fn bounce_text(&self, local_host_name: &str) -> Vec<u8> {
        let mut report = String::new();
        let _ = write!(
            report,
            "From: \"Mail Delivery System\" <postmaster@{host}>\r\n\
             To: <{sender}>\r\n\
             Subject: Delivery status notification\r\n\
             Date: {date}\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             This message was generated by {host}.\r\n\
             \r\n",
            host = local_host_name,
            sender = self.sender.lpdomain(),
            date = Utc::now().to_rfc2822(),
        );

        for r in &self.recipients {
            let verdict = match r.action {
                Action::Failed => "failed permanently",
                Action::Delayed => "is delayed and will be retried",
                Action::Relayed => "was relayed",
                Action::Delivered => "was delivered",
                Action::Expanded => "was expanded",
                Action::Unknown => "has not been attempted",
            };
            let _ = write!(
                report,
                "Delivery to <{}> {verdict}.\r\n",
                r.final_recipient.lpdomain(),
            );
            if !r.status.is_empty() {
                let _ = write!(report, "Status: {}\r\n", r.status);
            }
            let _ = write!(report, "\r\n");
        }

        if let Some(ref message_id) = self.message.message_id {
            let _ = write!(report, "Original message-id: {message_id}\r\n");
        }

        report.into_bytes()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_classification() {
        assert_eq!(
            AddressType::Normal,
            Address::new("zim", "earth.com").address_type(),
        );
        assert_eq!(AddressType::Bounce, Address::bounce().address_type());
        assert_eq!("zim@earth.com", Address::new("zim", "earth.com").lpdomain());
        assert_eq!("", Address::bounce().lpdomain());
    }

    #[test]
    fn pending_and_all_ok() {
        let message = Rc::new(Message::new(b"Subject: x\r\n\r\nhi\r\n".to_vec()));
        let mut dsn = Dsn::new(message, Address::new("zim", "earth.com"));
        dsn.add_recipient(Recipient::new(Address::new("gir", "irk.com")));
        dsn.add_recipient(Recipient::new(Address::new("dib", "earth.com")));

        assert!(dsn.deliveries_pending());
        assert!(!dsn.all_ok());

        dsn.recipients[0].set_action(Action::Relayed, "");
        assert!(dsn.deliveries_pending());

        dsn.recipients[1].set_action(Action::Failed, "5.2.0");
        assert!(!dsn.deliveries_pending());
        assert!(!dsn.all_ok());

        dsn.recipients[1].set_action(Action::Relayed, "");
        assert!(dsn.all_ok());
    }

    #[test]
    fn unicode_detection() {
        assert!(!Message::new(b"plain ascii".to_vec()).needs_unicode);
        assert!(Message::new("sübject".as_bytes().to_vec()).needs_unicode);
    }

    #[test]
    fn bounce_report_mentions_every_recipient() {
        let message = Rc::new(Message::new(b"x".to_vec()));
        let mut dsn = Dsn::new(message, Address::new("zim", "earth.com"));
        let mut failed = Recipient::new(Address::new("gir", "irk.com"));
        failed.set_action(Action::Failed, "5.2.0");
        let mut delayed = Recipient::new(Address::new("dib", "earth.com"));
        delayed.set_action(Action::Delayed, "4.4.1");
        dsn.add_recipient(failed);
        dsn.add_recipient(delayed);

        let report = String::from_utf8(dsn.bounce_text("mx.example.com")).unwrap();
        assert!(report.contains("To: <zim@earth.com>"));
        assert!(report.contains("<gir@irk.com> failed permanently"));
        assert!(report.contains("Status: 5.2.0"));
        assert!(report.contains("<dib@earth.com> is delayed"));
        assert!(report.contains("Status: 4.4.1"));
    }
}
