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

//! The inbound SMTP server, in its three dialects.
//!
//! Plain SMTP and LMTP accept mail for local users and deliver it into
//! their mailboxes; Submission takes mail from authenticated users and
//! spools it for the delivery agents. LMTP answers once per accepted
//! recipient after the final dot, the other two answer once per
//! message.

use std::borrow::Cow;
use std::rc::Rc;
use std::time::Duration;

use chrono::prelude::*;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::codes::*;
use super::dsn::{Address, AddressType};
use super::syntax::{looks_like_known_command, Command};
use crate::db::{Pool, Query, Value};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::proxy;
use crate::support::system_config::SystemConfig;

pub trait Io: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Io for T {}

const MAX_LINE: usize = 4096;
const IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Smtp,
    Lmtp,
    Submit,
}

impl Dialect {
    fn banner_role(self) -> &'static str {
        match self {
            Dialect::Smtp => "ESMTP",
            Dialect::Lmtp => "LMTP",
            Dialect::Submit => "SMTP Submission",
        }
    }

    fn with_protocol(self) -> &'static str {
        match self {
            Dialect::Smtp | Dialect::Submit => "ESMTP",
            Dialect::Lmtp => "LMTP",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses; forces a flush.
    Final,
    /// A non-final response which needs to go out immediately.
    Urgent,
    /// A non-final response that is safe to buffer.
    Delayable,
}

use self::ResponseKind::*;

impl ResponseKind {
    fn or_final(self, last: bool) -> Self {
        if last {
            Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Urgent | Delayable => '-',
        }
    }
}

macro_rules! require {
    ($this:expr, $($fns:ident = $arg:expr),*) => {
        $(if let Some(r) = $this.$fns($arg).await { return r; })*
    };
}

struct AuthenticatedUser {
    id: i64,
    login: String,
    permitted: Vec<(String, String)>,
}

struct RcptEntry {
    address: Address,
    /// For local delivery: the resolved destination mailbox.
    mailbox: Option<i64>,
}

/// Runs one inbound SMTP/LMTP/Submission connection to completion.
pub async fn run(
    io: Box<dyn Io>,
    dialect: Dialect,
    pool: Pool,
    config: Rc<SystemConfig>,
    log_prefix: LogPrefix,
    shutting_down: Rc<std::cell::Cell<bool>>,
) -> Result<(), Error> {
    let (waker, woken) = mpsc::unbounded_channel();
    let mut server = Server {
        io,
        dialect,
        pool,
        config,
        log_prefix,
        shutting_down,
        waker,
        woken,
        inbuf: Vec::new(),
        out: Vec::new(),
        maybe_proxy: true,
        quit: false,
        ineffective_commands: 0,
        helo_name: None,
        user: None,
        mail_from: None,
        recipients: Vec::new(),
        body: Vec::new(),
        transaction_id: None,
        transaction_time: None,
    };
    server.run().await
}

struct Server {
    io: Box<dyn Io>,
    dialect: Dialect,
    pool: Pool,
    config: Rc<SystemConfig>,
    log_prefix: LogPrefix,
    shutting_down: Rc<std::cell::Cell<bool>>,
    waker: mpsc::UnboundedSender<()>,
    woken: mpsc::UnboundedReceiver<()>,
    inbuf: Vec<u8>,
    out: Vec<u8>,
    maybe_proxy: bool,
    quit: bool,
    ineffective_commands: u32,
    helo_name: Option<String>,
    user: Option<AuthenticatedUser>,
    mail_from: Option<Address>,
    recipients: Vec<RcptEntry>,
    body: Vec<u8>,
    transaction_id: Option<String>,
    transaction_time: Option<DateTime<Utc>>,
}

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_response(
            Final,
            pc::ServiceReady,
            None,
            Cow::Owned(format!(
                "{} {}",
                self.dialect.banner_role(),
                self.config.hostname,
            )),
        )
        .await?;

        while !self.quit {
            let line = match self.next_line(MAX_LINE).await? {
                LineOutcome::Line(line) => line,
                LineOutcome::TooLong => {
                    warn!(
                        "{} Connection closed due to overlong line",
                        self.log_prefix,
                    );
                    self.send_response(
                        Final,
                        pc::CommandSyntaxError,
                        None,
                        Cow::Borrowed(
                            "Line too long (legal maximum is 998 bytes)",
                        ),
                    )
                    .await?;
                    return Ok(());
                },
                LineOutcome::TimedOut => {
                    info!("{} Idle timeout", self.log_prefix);
                    self.send_response(
                        Final,
                        pc::ServiceNotAvailableClosing,
                        None,
                        Cow::Borrowed("Tempus fugit"),
                    )
                    .await?;
                    return Ok(());
                },
                LineOutcome::Eof => {
                    return Err(Error::ClosedByPeer);
                },
            };

            if self.shutting_down.get() {
                self.send_response(
                    Final,
                    pc::ServiceNotAvailableClosing,
                    None,
                    Cow::Borrowed("Server shutdown"),
                )
                .await?;
                return Ok(());
            }

            self.run_command(&line).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, line: &[u8]) -> Result<(), Error> {
        self.ineffective_commands += 1;
        if self.ineffective_commands > 30 {
            warn!(
                "{} Terminating connection after too many non-mail commands",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::ServiceClosing,
                    None,
                    Cow::Borrowed(
                        "Too many commands issued without sending mail",
                    ),
                )
                .await;
        }

        let Ok(line) = std::str::from_utf8(line) else {
            warn!("{} Non-UTF-8 command received", self.log_prefix);
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    Cow::Borrowed("Malformed UTF-8"),
                )
                .await;
        };

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(()) => {
                warn!(
                    "{} Received bad command {:?}",
                    self.log_prefix,
                    &line[..line.len().min(64)],
                );
                return if looks_like_known_command(line) {
                    self.send_response(
                        Final,
                        pc::ParameterSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommandArguments)),
                        Cow::Borrowed("Unknown command syntax"),
                    )
                    .await
                } else {
                    self.send_response(
                        Final,
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommand)),
                        Cow::Borrowed("Unrecognised command"),
                    )
                    .await
                };
            },
        };

        match command {
            Command::Helo(command, origin) => {
                self.cmd_helo(command, origin).await
            },
            Command::Auth(mechanism, data) => {
                self.cmd_auth(mechanism, data).await
            },
            Command::MailFrom(email, size, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_mail_from(email, size).await
            },
            Command::Recipient(email, warnings) => {
                for warning in warnings {
                    warn!("{} {}", self.log_prefix, warning);
                }
                self.cmd_recipient(email).await
            },
            Command::Data => self.cmd_data().await,
            Command::BinaryData(len, last) => {
                self.cmd_binary_data(len, last).await
            },
            Command::Reset => self.cmd_reset().await,
            Command::Verify => {
                info!("{} Rejected attempt to use VRFY", self.log_prefix);
                self.send_response(
                    Final,
                    pc::CannotVerify,
                    Some((cc::Success, sc::OtherSecurity)),
                    Cow::Borrowed("VRFY not supported"),
                )
                .await
            },
            Command::Expand => {
                self.send_response(
                    Final,
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::SecurityFeaturesNotSupported)),
                    Cow::Borrowed("There are no mailing lists here"),
                )
                .await
            },
            Command::Help => self.cmd_help().await,
            Command::Noop => {
                self.send_response(
                    Final,
                    pc::Ok,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Borrowed("OK"),
                )
                .await
            },
            Command::Quit => {
                self.quit = true;
                self.send_response(
                    Final,
                    pc::ServiceClosing,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Borrowed("Bye"),
                )
                .await
            },
            Command::StartTls => {
                self.send_response(
                    Final,
                    pc::ActionNotTakenPermanent,
                    None,
                    Cow::Borrowed("TLS not configured"),
                )
                .await
            },
        }
    }

    async fn cmd_helo(
        &mut self,
        command: String,
        origin: String,
    ) -> Result<(), Error> {
        let extended = !"HELO".eq_ignore_ascii_case(&command);
        let lhlo = "LHLO".eq_ignore_ascii_case(&command);
        if lhlo != (self.dialect == Dialect::Lmtp) {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed(if lhlo {
                        "This is not an LMTP server"
                    } else {
                        "I speak LMTP only"
                    }),
                )
                .await;
        }

        self.log_prefix.set_helo(origin.clone());
        info!("{} SMTP {command}", self.log_prefix);
        self.helo_name = Some(origin.clone());

        self.send_response(
            Delayable.or_final(!extended),
            pc::Ok,
            None,
            Cow::Owned(format!(
                "{} salutations, {}",
                self.config.hostname, origin,
            )),
        )
        .await?;

        if extended {
            let size = self.config.memory_limit * 150_000;
            let mut extensions = vec![
                "8BITMIME".to_owned(),
                "BINARYMIME".to_owned(),
                "CHUNKING".to_owned(),
                "ENHANCEDSTATUSCODES".to_owned(),
                "PIPELINING".to_owned(),
                format!("SIZE {size}"),
                "SMTPUTF8".to_owned(),
            ];
            if self.dialect == Dialect::Submit {
                extensions.insert(1, "AUTH PLAIN".to_owned());
            }
            extensions.push("HELP".to_owned());

            for (ix, extension) in extensions.iter().enumerate() {
                self.send_response(
                    Delayable.or_final(ix + 1 == extensions.len()),
                    pc::Ok,
                    None,
                    Cow::Borrowed(extension),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        data: Option<String>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = false);

        if self.dialect != Dialect::Submit {
            warn!(
                "{} Rejected attempt to AUTH on an unauthenticated service",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::CommandNotImplemented,
                    Some((cc::PermFail, sc::SecurityFeaturesNotSupported)),
                    Cow::Borrowed("Authentication is not supported here"),
                )
                .await;
        }

        if self.user.is_some() {
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    None,
                    Cow::Borrowed("Already authenticated"),
                )
                .await;
        }

        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            warn!(
                "{} Rejected attempt to auth with method {mechanism:?}",
                self.log_prefix,
            );
            return self
                .send_response(
                    Final,
                    pc::CommandParameterNotImplemented,
                    Some((cc::PermFail, sc::InvalidCommandArguments)),
                    Cow::Borrowed("Unsupported AUTH mechanism"),
                )
                .await;
        }

        let data = match data {
            Some(data) if data != "=" => data,
            _ => {
                self.send_response(
                    Final,
                    pc::ServerChallenge,
                    None,
                    Cow::Borrowed(""),
                )
                .await?;

                match self.next_line(MAX_LINE).await? {
                    LineOutcome::Line(line) => {
                        String::from_utf8_lossy(&line).into_owned()
                    },
                    _ => {
                        return Err(Error::ClosedByPeer);
                    },
                }
            },
        };

        if data == "*" {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    None,
                    Cow::Borrowed("SASL aborted"),
                )
                .await;
        }

        let Some(decoded) = base64::decode(&data)
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        else {
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Invalid base64"),
                )
                .await;
        };

        // RFC 2595 PLAIN: authorise-id NUL authenticate-id NUL password.
        let mut parts = decoded.split('\x00');
        let (Some(authorise), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return self
                .send_response(
                    Final,
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Invalid auth syntax"),
                )
                .await;
        };

        if !authorise.is_empty() && authorise != authenticate {
            return self
                .send_response(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    Some((
                        cc::PermFail,
                        sc::AuthenticationCredentialsInvalid,
                    )),
                    Cow::Borrowed("authorise-id must match authenticate-id"),
                )
                .await;
        }

        let login = Query::new(
            "select id from users where login=$1 and secret=$2",
            vec![
                Value::Text(authenticate.to_owned()),
                Value::Text(password.to_owned()),
            ],
        );
        self.run_query(&login).await;

        let Some(row) = login.next_row() else {
            return self
                .send_response(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    Some((
                        cc::PermFail,
                        sc::AuthenticationCredentialsInvalid,
                    )),
                    Cow::Borrowed("Authentication failed"),
                )
                .await;
        };
        let user_id = row.get_int("id");

        // The addresses this user may use as MAIL FROM.
        let permitted = Query::new(
            "select distinct a.localpart::text, a.domain::text \
             from addresses a \
             join aliases al on (a.id=al.address) \
             join mailboxes mb on (al.mailbox=mb.id) \
             where mb.owner=$1 or mb.id in\
             (select mailbox from permissions \
             where rights ilike '%p%' \
             and (identifier='anyone' or identifier=$2))",
            vec![
                Value::Int(user_id),
                Value::Text(authenticate.to_owned()),
            ],
        );
        self.run_query(&permitted).await;

        let mut addresses = Vec::new();
        while let Some(row) = permitted.next_row() {
            addresses.push((
                row.get_text("localpart").to_owned(),
                row.get_text("domain").to_owned(),
            ));
        }

        info!("{} Authenticated as {authenticate}", self.log_prefix);
        self.log_prefix.set_user(authenticate.to_owned());
        self.user = Some(AuthenticatedUser {
            id: user_id,
            login: authenticate.to_owned(),
            permitted: addresses,
        });

        self.send_response(
            Final,
            pc::AuthenticationSucceeded,
            Some((cc::Success, sc::OtherSecurity)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_mail_from(
        &mut self,
        return_path: String,
        approx_size: Option<u64>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = false);

        if self.dialect == Dialect::Submit && self.user.is_none() {
            return self
                .send_response(
                    Final,
                    pc::AuthenticationRequired,
                    Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                    Cow::Borrowed("Authentication required"),
                )
                .await;
        }

        let size_limit = self.config.memory_limit * 150_000;
        if approx_size.unwrap_or(0) > size_limit {
            return self
                .send_response(
                    Final,
                    pc::ExceededStorageAllocation,
                    Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                    Cow::Owned(format!(
                        "Maximum message size is {size_limit} bytes",
                    )),
                )
                .await;
        }

        let Some(sender) = parse_path(&return_path) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Unparsable return path"),
                )
                .await;
        };

        if self.dialect == Dialect::Submit
            && sender.address_type() == AddressType::Normal
        {
            let permitted = self.user.as_ref().is_some_and(|u| {
                u.permitted.iter().any(|(lp, dom)| {
                    lp.eq_ignore_ascii_case(&sender.localpart)
                        && dom.eq_ignore_ascii_case(&sender.domain)
                })
            });
            if !permitted {
                warn!(
                    "{} Rejected MAIL FROM:<{}>: not a permitted address",
                    self.log_prefix,
                    sender.lpdomain(),
                );
                return self
                    .send_response(
                        Final,
                        pc::ActionNotTakenPermanent,
                        Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                        Cow::Borrowed(
                            "Not allowed to send mail as that address",
                        ),
                    )
                    .await;
            }
        }

        info!("{} Start mail transaction", self.log_prefix);
        let id = self.transaction_id();
        info!("{} Assigned transaction ID {id}", self.log_prefix);
        self.ineffective_commands = 0;
        self.mail_from = Some(sender);
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_recipient(
        &mut self,
        forward_path: String,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_mail_from = true);

        let Some(address) = parse_path(&forward_path) else {
            return self
                .send_response(
                    Final,
                    pc::ParameterSyntaxError,
                    Some((cc::PermFail, sc::SyntaxError)),
                    Cow::Borrowed("Unparsable forward path"),
                )
                .await;
        };
        if address.address_type() != AddressType::Normal {
            return self
                .send_response(
                    Final,
                    pc::MailboxNameNotAllowed,
                    Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                    Cow::Borrowed("Empty forward path"),
                )
                .await;
        }

        let entry = match self.dialect {
            Dialect::Smtp | Dialect::Lmtp => {
                // Local delivery only: the address must resolve to a
                // mailbox.
                let resolve = Query::new(
                    "select mb.id as mailbox, a.id as address \
                     from addresses a \
                     join aliases al on (al.address=a.id) \
                     join mailboxes mb on (al.mailbox=mb.id) \
                     where lower(a.localpart)=lower($1) \
                     and lower(a.domain)=lower($2)",
                    vec![
                        Value::Text(address.localpart.clone()),
                        Value::Text(address.domain.clone()),
                    ],
                );
                self.run_query(&resolve).await;

                let Some(row) = resolve.next_row() else {
                    info!(
                        "{} Rejected recipient <{}>",
                        self.log_prefix,
                        address.lpdomain(),
                    );
                    return self
                        .send_response(
                            Final,
                            pc::ActionNotTakenPermanent,
                            Some((
                                cc::PermFail,
                                sc::BadDestinationMailboxAddress,
                            )),
                            Cow::Borrowed("No such user"),
                        )
                        .await;
                };
                let mut address = address;
                address.id = Some(row.get_int("address"));
                RcptEntry {
                    address,
                    mailbox: Some(row.get_int("mailbox")),
                }
            },

            Dialect::Submit => {
                let mut address = address;
                address.id =
                    self.resolve_or_create_address(&address).await;
                RcptEntry {
                    address,
                    mailbox: None,
                }
            },
        };

        info!(
            "{} Recipient: {}",
            self.log_prefix,
            entry.address.lpdomain(),
        );
        self.ineffective_commands = 0;
        self.recipients.push(entry);
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::DestinationAddressValid)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        require!(
            self,
            need_helo = true,
            need_mail_from = true,
            need_recipients = true
        );

        self.ineffective_commands = 0;
        self.send_response(
            Final,
            pc::StartMailInput,
            None,
            Cow::Borrowed("Go ahead"),
        )
        .await?;

        info!("{} Begin data transfer", self.log_prefix);
        loop {
            match self.next_line(usize::MAX).await? {
                LineOutcome::Line(line) => {
                    if line == b"." {
                        break;
                    }
                    let stripped = if line.first() == Some(&b'.') {
                        &line[1..]
                    } else {
                        &line[..]
                    };
                    self.body.extend_from_slice(stripped);
                    self.body.extend_from_slice(b"\r\n");
                },
                LineOutcome::TimedOut => {
                    self.send_response(
                        Final,
                        pc::ServiceNotAvailableClosing,
                        None,
                        Cow::Borrowed("Tempus fugit"),
                    )
                    .await?;
                    self.quit = true;
                    return Ok(());
                },
                _ => return Err(Error::ClosedByPeer),
            }
        }

        self.finish_message().await
    }

    async fn cmd_binary_data(
        &mut self,
        len: u64,
        last: bool,
    ) -> Result<(), Error> {
        // The chunk must be consumed whatever we think of the command.
        let consumed = self.buffer_octets(len as usize).await?;
        if !consumed {
            return Err(Error::ClosedByPeer);
        }

        if self.helo_name.is_none()
            || self.mail_from.is_none()
            || self.recipients.is_empty()
        {
            self.body.clear();
            return self
                .send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed("BDAT out of order"),
                )
                .await;
        }

        self.ineffective_commands = 0;
        if last {
            info!("{} Completed binary data transfer", self.log_prefix);
            self.finish_message().await
        } else {
            self.send_response(
                Final,
                pc::Ok,
                Some((cc::Success, sc::Undefined)),
                Cow::Borrowed("OK"),
            )
            .await
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        if self.mail_from.is_some()
            || !self.recipients.is_empty()
            || !self.body.is_empty()
        {
            info!("{} State reset", self.log_prefix);
        }
        self.mail_from = None;
        self.recipients.clear();
        self.body.clear();
        self.transaction_id = None;
        self.transaction_time = None;
        self.send_response(
            Final,
            pc::Ok,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("OK"),
        )
        .await
    }

    async fn cmd_help(&mut self) -> Result<(), Error> {
        self.send_response(
            Delayable,
            pc::HelpMessage,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("This is the Archiveopteryx mail server."),
        )
        .await?;
        self.send_response(
            Final,
            pc::HelpMessage,
            Some((cc::Success, sc::Undefined)),
            Cow::Borrowed("End of HELP"),
        )
        .await
    }

    /// Injects or spools the accepted message, and answers: one status
    /// per recipient for LMTP, a single status otherwise.
    async fn finish_message(&mut self) -> Result<(), Error> {
        let message = self.assemble_message();
        let tx = self.pool.transaction();

        let insert_message = Query::new(
            "insert into messages (header, body) values ($1, $2) \
             returning id",
            split_message(&message),
        );
        tx.enqueue(&insert_message);
        tx.execute(&self.waker);
        self.await_query(&insert_message).await;

        let Some(row) = insert_message.next_row() else {
            tx.rollback();
            return self.fail_whole_transaction().await;
        };
        let message_id = row.get_int("id");

        let mut delivered = vec![true; self.recipients.len()];
        let mut channel = "mailboxes_updated";

        match self.dialect {
            Dialect::Smtp | Dialect::Lmtp => {
                for entry in &self.recipients {
                    let mailbox =
                        entry.mailbox.expect("local rcpt has a mailbox");
                    tx.enqueue(&Query::new(
                        "insert into mailbox_messages \
                         (mailbox, message, uid, flags, idate, \
                         rfc822size, modseq) \
                         select id, $2, uidnext, '\\Recent', \
                         current_timestamp, $3, nextmodseq \
                         from mailboxes where id=$1",
                        vec![
                            Value::Int(mailbox),
                            Value::Int(message_id),
                            Value::Int(message.len() as i64),
                        ],
                    ));
                    tx.enqueue(&Query::new(
                        "update mailboxes \
                         set uidnext=uidnext+1, nextmodseq=nextmodseq+1 \
                         where id=$1",
                        vec![Value::Int(mailbox)],
                    ));
                }
            },

            Dialect::Submit => {
                channel = "deliveries_updated";
                let sender = self.mail_from.clone().unwrap();
                let sender_id = match sender.address_type() {
                    AddressType::Normal => {
                        self.resolve_or_create_address(&sender).await
                    },
                    AddressType::Bounce => None,
                };

                let insert_delivery = Query::new(
                    "insert into deliveries \
                     (message, sender, injected_at, expires_at) \
                     values ($1, $2, current_timestamp, \
                     current_timestamp+interval '900 s') \
                     returning id",
                    vec![
                        Value::Int(message_id),
                        sender_id.map(Value::Int).unwrap_or(Value::Null),
                    ],
                );
                tx.enqueue(&insert_delivery);
                tx.execute(&self.waker);
                self.await_query(&insert_delivery).await;

                let Some(row) = insert_delivery.next_row() else {
                    tx.rollback();
                    return self.fail_whole_transaction().await;
                };
                let delivery_id = row.get_int("id");

                for entry in &self.recipients {
                    tx.enqueue(&Query::new(
                        "insert into delivery_recipients \
                         (delivery, recipient) values ($1, $2)",
                        vec![
                            Value::Int(delivery_id),
                            entry
                                .address
                                .id
                                .map(Value::Int)
                                .unwrap_or(Value::Null),
                        ],
                    ));
                }
            },
        }

        tx.commit(&self.waker);
        while !tx.done() {
            if self.woken.recv().await.is_none() {
                break;
            }
        }

        if tx.failed() {
            warn!(
                "{} Could not store message: {}",
                self.log_prefix,
                tx.error().unwrap_or_default(),
            );
            delivered.iter_mut().for_each(|d| *d = false);
        } else {
            self.pool.notify(channel);
        }

        let responses = if self.dialect == Dialect::Lmtp {
            delivered
        } else {
            vec![delivered.iter().all(|&d| d)]
        };

        let transaction_id = self.transaction_id();
        let count = responses.len();
        for (ix, ok) in responses.into_iter().enumerate() {
            if ok {
                self.send_response(
                    Urgent.or_final(ix + 1 == count),
                    pc::Ok,
                    Some((cc::Success, sc::Undefined)),
                    Cow::Owned(format!("{transaction_id} accepted")),
                )
                .await?;
            } else {
                self.send_response(
                    Urgent.or_final(ix + 1 == count),
                    pc::ActionAborted,
                    Some((cc::TempFail, sc::OtherMailSystem)),
                    Cow::Borrowed("Could not store message"),
                )
                .await?;
            }
        }

        info!("{} Completed data transfer", self.log_prefix);
        self.mail_from = None;
        self.recipients.clear();
        self.body.clear();
        self.transaction_id = None;
        self.transaction_time = None;
        Ok(())
    }

    async fn fail_whole_transaction(&mut self) -> Result<(), Error> {
        let count = if self.dialect == Dialect::Lmtp {
            self.recipients.len()
        } else {
            1
        };
        for ix in 0..count {
            self.send_response(
                Urgent.or_final(ix + 1 == count),
                pc::ActionAborted,
                Some((cc::TempFail, sc::OtherMailSystem)),
                Cow::Borrowed("Could not store message"),
            )
            .await?;
        }
        self.body.clear();
        self.mail_from = None;
        self.recipients.clear();
        Ok(())
    }

    /// The stored form of the message: our Received field, then what the
    /// client sent.
    fn assemble_message(&mut self) -> Vec<u8> {
        let id = self.transaction_id();
        let transaction_time = self.transaction_time().to_rfc2822();
        let received = format!(
            "Received: from {} by {} with {} id {}; {}\r\n",
            self.helo_name.as_deref().unwrap_or("unknown"),
            self.config.hostname,
            self.dialect.with_protocol(),
            id,
            transaction_time,
        );

        let mut message = received.into_bytes();
        message.extend_from_slice(&self.body);
        message
    }

    /// The ESMTP transaction id: unix time, pid, session log id. Stable
    /// until the transaction ends.
    fn transaction_id(&mut self) -> String {
        if let Some(ref id) = self.transaction_id {
            return id.clone();
        }
        let id = format!(
            "{}-{}-{}",
            self.transaction_time().timestamp(),
            std::process::id(),
            self.log_prefix.id(),
        );
        self.transaction_id = Some(id.clone());
        id
    }

    /// The frozen transaction time.
    fn transaction_time(&mut self) -> DateTime<Utc> {
        *self.transaction_time.get_or_insert_with(Utc::now)
    }

    async fn resolve_or_create_address(
        &self,
        address: &Address,
    ) -> Option<i64> {
        let select = Query::new(
            "select id from addresses \
             where localpart=$1 and domain=$2",
            vec![
                Value::Text(address.localpart.clone()),
                Value::Text(address.domain.clone()),
            ],
        );
        self.run_query(&select).await;
        if let Some(row) = select.next_row() {
            return Some(row.get_int("id"));
        }

        let insert = Query::new(
            "insert into addresses (localpart, domain) \
             values ($1, $2) returning id",
            vec![
                Value::Text(address.localpart.clone()),
                Value::Text(address.domain.clone()),
            ],
        );
        self.run_query(&insert).await;
        insert.next_row().map(|row| row.get_int("id"))
    }

    async fn need_helo(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.helo_name.is_some(),
            present,
            "Already got HELO",
            "Still waiting for HELO",
        )
        .await
    }

    async fn need_mail_from(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.mail_from.is_some(),
            present,
            "Already got MAIL FROM",
            "Still waiting for MAIL FROM",
        )
        .await
    }

    async fn need_recipients(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            !self.recipients.is_empty(),
            present,
            "Already have recipients",
            "No recipients",
        )
        .await
    }

    async fn check_need(
        &mut self,
        current_status: bool,
        desired_status: bool,
        message_if_already_present: &str,
        message_if_missing: &str,
    ) -> Option<Result<(), Error>> {
        if current_status != desired_status {
            Some(
                self.send_response(
                    Final,
                    pc::BadSequenceOfCommands,
                    Some((cc::PermFail, sc::InvalidCommand)),
                    Cow::Borrowed(if current_status {
                        message_if_already_present
                    } else {
                        message_if_missing
                    }),
                )
                .await,
            )
        } else {
            None
        }
    }

    async fn send_response(
        &mut self,
        kind: ResponseKind,
        primary_code: PrimaryCode,
        secondary_code: Option<(ClassCode, SubjectCode)>,
        quip: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        if primary_code == pc::ServiceClosing
            || primary_code == pc::ServiceNotAvailableClosing
        {
            self.quit = true;
        }

        let mut s = String::new();
        let _ = write!(s, "{}{}", primary_code as u16, kind.indicator());
        if let Some((class, subject)) = secondary_code {
            let subject = subject as u16;
            let _ = write!(
                s,
                "{}.{}.{} ",
                class as u8,
                subject / 10,
                subject % 10,
            );
        }
        let _ = write!(s, "{}\r\n", quip);

        self.out.extend_from_slice(s.as_bytes());
        match kind {
            Final | Urgent => {
                let out = std::mem::take(&mut self.out);
                self.io.write_all(&out).await?;
                self.io.flush().await?;
            },
            Delayable => {},
        }

        Ok(())
    }

    /// Executes a standalone query and waits for it.
    async fn run_query(&self, query: &Query) {
        self.pool.execute(query, self.waker.clone());
        // Completion pings share the session's waker channel, which this
        // borrow cannot drain; the backend yields after each request, so
        // polling the query itself converges promptly.
        while !query.done() {
            tokio::task::yield_now().await;
        }
    }

    async fn await_query(&mut self, query: &Query) {
        while !query.done() {
            if self.woken.recv().await.is_none() {
                return;
            }
        }
    }

    /// Reads `n` raw octets into the body buffer.
    async fn buffer_octets(&mut self, n: usize) -> Result<bool, Error> {
        let mut chunk = [0u8; 4096];
        while self.inbuf.len() < n {
            let read = tokio::time::timeout(
                IDLE_TIMEOUT,
                self.io.read(&mut chunk),
            )
            .await;
            match read {
                Err(_timeout) => return Ok(false),
                Ok(Ok(0)) => return Ok(false),
                Ok(Ok(got)) => {
                    self.inbuf.extend_from_slice(&chunk[..got])
                },
                Ok(Err(e)) => return Err(Error::Io(e)),
            }
        }
        self.body.extend(self.inbuf.drain(..n));
        Ok(true)
    }

    /// Reads the next CRLF (or LF) delimited line, consuming a PROXY v2
    /// leader if one arrives before any protocol input.
    async fn next_line(
        &mut self,
        max: usize,
    ) -> Result<LineOutcome, Error> {
        let mut chunk = [0u8; 4096];
        loop {
            if self.maybe_proxy {
                match proxy::decode(&self.log_prefix, &self.inbuf) {
                    proxy::Leader::Incomplete => {},
                    proxy::Leader::NotProxy => self.maybe_proxy = false,
                    proxy::Leader::Parsed { consumed, command } => {
                        self.inbuf.drain(..consumed);
                        self.maybe_proxy = false;
                        if let proxy::Command::Proxy(peer, slf) = command {
                            info!(
                                "{} PROXY peer={peer} self={slf}",
                                self.log_prefix,
                            );
                        }
                    },
                }
            }

            if !self.maybe_proxy {
                if let Some(eol) = memchr::memchr(b'\n', &self.inbuf) {
                    let mut end = eol;
                    if end > 0 && self.inbuf[end - 1] == b'\r' {
                        end -= 1;
                    }
                    let line = self.inbuf[..end].to_vec();
                    self.inbuf.drain(..eol + 1);
                    return Ok(LineOutcome::Line(line));
                }
                if self.inbuf.len() > max {
                    return Ok(LineOutcome::TooLong);
                }
            }

            let read = tokio::time::timeout(
                IDLE_TIMEOUT,
                self.io.read(&mut chunk),
            )
            .await;
            match read {
                Err(_timeout) => return Ok(LineOutcome::TimedOut),
                Ok(Ok(0)) => return Ok(LineOutcome::Eof),
                Ok(Ok(n)) => self.inbuf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(Error::Io(e)),
            }
        }
    }
}

enum LineOutcome {
    Line(Vec<u8>),
    TooLong,
    TimedOut,
    Eof,
}

/// Parses an SMTP path argument into an Address. The empty path is the
/// bounce address.
fn parse_path(path: &str) -> Option<Address> {
    if path.is_empty() {
        return Some(Address::bounce());
    }
    let (localpart, domain) = path.rsplit_once('@')?;
    if localpart.is_empty() || domain.is_empty() {
        return None;
    }
    Some(Address::new(localpart, domain))
}

/// Splits a stored message into (header, body) bind values.
fn split_message(rfc822: &[u8]) -> Vec<Value> {
    let text = String::from_utf8_lossy(rfc822);
    match text.find("\r\n\r\n") {
        Some(ix) => vec![
            Value::Text(text[..ix].to_owned()),
            Value::Text(text[ix + 4..].to_owned()),
        ],
        None => {
            vec![Value::Text(text.into_owned()), Value::Text(String::new())]
        },
    }
}
