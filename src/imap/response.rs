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

//! Queued untagged responses and the rules deciding when each may be
//! sent.
//!
//! Most responses go out as soon as anything is emitted at all, but a
//! response that renumbers messages (EXPUNGE, VANISHED) must wait until
//! no command that could be using message sequence numbers is in
//! flight. Because of that, responses which mention a message hold its
//! UID and render their MSN only at the moment of emission.

/// An untagged response waiting to be sent.
#[derive(Clone, Debug)]
pub struct ImapResponse {
    kind: Kind,
    /// A response which has become meaningless (e.g. it refers to a
    /// mailbox the session has left) is dropped rather than sent.
    pub meaningful: bool,
    pub sent: bool,
}

#[derive(Clone, Debug)]
enum Kind {
    /// A fully rendered line, sans the leading `* `.
    Line(String),
    /// `* <msn> EXPUNGE`, or `* VANISHED <uid>` under QRESYNC.
    Expunge { uid: u32 },
    /// `* <msn> FETCH (<attrs>)`.
    Fetch { uid: u32, attrs: String },
}

impl ImapResponse {
    pub fn line(text: impl Into<String>) -> Self {
        ImapResponse {
            kind: Kind::Line(text.into()),
            meaningful: true,
            sent: false,
        }
    }

    pub fn expunge(uid: u32) -> Self {
        ImapResponse {
            kind: Kind::Expunge { uid },
            meaningful: true,
            sent: false,
        }
    }

    pub fn fetch(uid: u32, attrs: impl Into<String>) -> Self {
        ImapResponse {
            kind: Kind::Fetch {
                uid,
                attrs: attrs.into(),
            },
            meaningful: true,
            sent: false,
        }
    }

    /// True for responses that invalidate message sequence numbers.
    pub fn changes_msn(&self) -> bool {
        matches!(self.kind, Kind::Expunge { .. })
    }

    /// The UID this response is about, if any.
    pub fn uid(&self) -> Option<u32> {
        match self.kind {
            Kind::Line(_) => None,
            Kind::Expunge { uid } | Kind::Fetch { uid, .. } => Some(uid),
        }
    }

    /// Renders the response against the current MSN map, updating the
    /// map for an expunge. Returns `None` when the message is already
    /// gone, in which case the response is moot.
    pub fn render(
        &self,
        msns: &mut Vec<u32>,
        qresync: bool,
    ) -> Option<String> {
        match self.kind {
            Kind::Line(ref text) => Some(text.clone()),
            Kind::Expunge { uid } => {
                let ix = msns.iter().position(|&u| u == uid)?;
                msns.remove(ix);
                if qresync {
                    Some(format!("VANISHED {uid}"))
                } else {
                    Some(format!("{} EXPUNGE", ix + 1))
                }
            },
            Kind::Fetch { uid, ref attrs } => {
                let ix = msns.iter().position(|&u| u == uid)?;
                Some(format!("{} FETCH ({attrs})", ix + 1))
            },
        }
    }
}
