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

//! Response codes from RFC 5321, and extended response codes from RFC 3463.
//!
//! The module is designed to be wildcard-imported, and defines submodules
//! with short names for accessing the enum values in a consistent way.
#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    // In the order RFC 5321 defines them
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    CommandParameterNotImplemented = 504,
    SystemStatus = 211,
    HelpMessage = 214,
    ServiceReady = 220,
    ServiceClosing = 221,
    ServiceNotAvailableClosing = 421,
    Ok = 250,
    WillForward = 251,
    CannotVerify = 252,
    ServerChallenge = 334,
    AuthenticationSucceeded = 235,
    AuthenticationCredentialsInvalid = 535,
    AuthenticationRequired = 530,
    EncryptionRequiredForRequestedAuthenticationMechanism = 538,
    ActionNotTakenTemporary = 450,
    ActionNotTakenPermanent = 550,
    ActionAborted = 451,
    UserNotLocal = 551,
    InsufficientStorage = 452,
    ExceededStorageAllocation = 552,
    MailboxNameNotAllowed = 553,
    StartMailInput = 354,
    TransactionFailed = 554,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClassCode {
    Success = 2,
    TempFail = 4,
    PermFail = 5,
}

pub mod cc {
    pub use super::ClassCode::*;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum SubjectCode {
    Undefined = 0,
    OtherAddressStatus = 10,
    BadDestinationMailboxAddress = 11,
    DestinationAddressValid = 15,
    OtherMailboxStatus = 20,
    MailboxFull = 22,
    MessageLengthExceedsLimit = 34,
    OtherMailSystem = 30,
    OtherNetwork = 40,
    BadConnection = 42,
    DeliveryTimeExpired = 47,
    OtherProtocolStatus = 50,
    InvalidCommand = 51,
    SyntaxError = 52,
    TooManyRecipients = 53,
    InvalidCommandArguments = 54,
    OtherSecurity = 70,
    DeliveryNotAuthorised = 71,
    SecurityFeaturesNotSupported = 73,
    AuthenticationCredentialsInvalid = 78,
}

pub mod sc {
    pub use super::SubjectCode::*;
}

/// Where in a client transaction a reply was received; a couple of reply
/// codes map to different enhanced statuses depending on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyPhase {
    MailFrom,
    RcptTo,
    Other,
}

/// Derives the RFC 3463 status triple for a complete server reply line.
///
/// If the server advertised ENHANCEDSTATUSCODES and the line carries a
/// well-formed triple after the reply code, that triple wins. Otherwise
/// the status is derived from the reply code per the RFC 5321 reply list,
/// falling back to `<class>.0.0`.
pub fn enhanced_status(
    line: &str,
    enhanced_supported: bool,
    phase: ReplyPhase,
) -> String {
    let bytes = line.as_bytes();
    if enhanced_supported
        && bytes.get(4).is_some_and(|&c| (b'2'..=b'5').contains(&c))
        && bytes.get(5) == Some(&b'.')
    {
        let tail = &line[4..];
        let end = tail.find(' ').unwrap_or(tail.len());
        let candidate = &tail[..end];
        if candidate.split('.').count() == 3
            && candidate
                .split('.')
                .all(|part| !part.is_empty() && part.bytes().all(|c| c.is_ascii_digit()))
        {
            return candidate.to_owned();
        }
    }

    let reply = line.get(..3).and_then(|s| s.parse::<u32>().ok());
    let reply = match reply {
        Some(r) if (200..600).contains(&r) => r,
        _ => return "4.0.0".to_owned(),
    };

    match reply {
        211 | 214 | 220 | 221 | 252 | 354 => "2.0.0".to_owned(),
        250 => match phase {
            ReplyPhase::MailFrom | ReplyPhase::RcptTo => "2.1.0".to_owned(),
            ReplyPhase::Other => "2.0.0".to_owned(),
        },
        251 => "2.1.0".to_owned(),
        421 => "4.3.0".to_owned(),
        450 | 451 | 452 => "4.2.0".to_owned(),
        // Command-level errors on a working connection are worth a retry
        // after the queue has cooled off.
        500..=504 => "4.3.0".to_owned(),
        550 | 551 | 553 => "5.2.0".to_owned(),
        552 => "5.3.0".to_owned(),
        554 => "5.0.0".to_owned(),
        r => format!("{}.0.0", r / 100),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn explicit_triple_wins_when_advertised() {
        assert_eq!(
            "5.7.1",
            enhanced_status(
                "550 5.7.1 Relaying denied",
                true,
                ReplyPhase::RcptTo,
            ),
        );
        // Not advertised: fall back to the table.
        assert_eq!(
            "5.2.0",
            enhanced_status(
                "550 5.7.1 Relaying denied",
                false,
                ReplyPhase::RcptTo,
            ),
        );
    }

    #[test]
    fn malformed_triple_falls_back() {
        assert_eq!(
            "5.2.0",
            enhanced_status("550 5.q Nope", true, ReplyPhase::RcptTo),
        );
        assert_eq!(
            "5.2.0",
            enhanced_status("550 5. Nope", true, ReplyPhase::RcptTo),
        );
    }

    #[test]
    fn table_entries() {
        assert_eq!(
            "2.1.0",
            enhanced_status("250 OK", false, ReplyPhase::MailFrom),
        );
        assert_eq!(
            "2.0.0",
            enhanced_status("250 OK", false, ReplyPhase::Other),
        );
        assert_eq!(
            "4.3.0",
            enhanced_status("421 Bye", false, ReplyPhase::Other),
        );
        assert_eq!(
            "4.2.0",
            enhanced_status("452 Full", false, ReplyPhase::RcptTo),
        );
        assert_eq!(
            "5.3.0",
            enhanced_status("552 Too big", false, ReplyPhase::Other),
        );
        assert_eq!(
            "4.3.0",
            enhanced_status("502 Unimplemented", false, ReplyPhase::Other),
        );
    }

    #[test]
    fn garbage_is_a_soft_failure() {
        assert_eq!(
            "4.0.0",
            enhanced_status("banana", false, ReplyPhase::Other),
        );
        assert_eq!("4.0.0", enhanced_status("", true, ReplyPhase::Other));
        assert_eq!(
            "4.0.0",
            enhanced_status("199 huh", false, ReplyPhase::Other),
        );
    }
}
