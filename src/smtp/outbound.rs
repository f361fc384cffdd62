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

//! The SMTP client which forwards outgoing mail to the smarthost.
//!
//! One client sends one DSN per mail transaction and is returned to the
//! idle pool with RSET, so a burst of deliveries reuses a single
//! connection. The smarthost's verdict on each recipient is recorded on
//! the DSN in place; the caller never sees an error as control flow, only
//! as recipient actions and the client's own state.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::codes::{enhanced_status, ReplyPhase};
use super::dsn::{Action, AddressType, Dsn};
use crate::support::{error::Error, log_prefix::LogPrefix};

const MAX_LINE: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);
/// How long the singleton idle client lingers before QUIT.
pub const IDLE_LOGOUT: Duration = Duration::from_secs(298);
/// How long any further idle client lingers.
pub const EXTRA_IDLE_LOGOUT: Duration = Duration::from_secs(15);

pub trait Io: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Io for T {}

/// Where the client stands in its protocol exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Invalid,
    Connected,
    Banner,
    Hello,
    MailFrom,
    RcptTo,
    Data,
    Body,
    Error,
    Rset,
    Quit,
}

#[derive(Clone, Copy, Debug, Default)]
struct Extensions {
    enhanced_status_codes: bool,
    unicode: bool,
    size: bool,
    observed_size: Option<u64>,
}

pub struct SmtpClient {
    io: Box<dyn Io>,
    log_prefix: LogPrefix,
    local_host_name: String,
    state: State,
    closed: bool,
    sent_helo: bool,
    extensions: Extensions,
    error: Option<String>,
    last_sent: String,

    line_buffer: [u8; MAX_LINE],
    line_buffer_len: usize,
    response_deadline: Instant,
}

impl SmtpClient {
    /// Connects to the smarthost.
    pub async fn connect(
        log_prefix: LogPrefix,
        address: &str,
        port: u16,
        local_host_name: String,
    ) -> Result<Self, Error> {
        info!("{} Connecting to {address}:{port}", log_prefix);
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((address, port)),
        )
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Timed out connecting to smarthost",
            ))
        })??;

        Ok(Self::new(Box::new(stream), log_prefix, local_host_name))
    }

    /// Wraps an established connection; the banner has not been read yet.
    pub fn new(
        io: Box<dyn Io>,
        log_prefix: LogPrefix,
        local_host_name: String,
    ) -> Self {
        SmtpClient {
            io,
            log_prefix,
            local_host_name,
            state: State::Connected,
            closed: false,
            sent_helo: false,
            extensions: Extensions::default(),
            error: None,
            last_sent: String::new(),
            line_buffer: [0u8; MAX_LINE],
            line_buffer_len: 0,
            response_deadline: Instant::now() + RESPONSE_TIMEOUT,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// True if this client can accept a `send()` right now.
    pub fn ready(&self) -> bool {
        matches!(
            self.state,
            State::Invalid | State::Connected | State::Hello | State::Rset,
        )
    }

    /// True if the connection is still worth keeping around.
    pub fn usable(&self) -> bool {
        !self.closed && self.ready()
    }

    /// The SIZE limit worth advertising on our own submission service:
    /// our memory budget scaled up, or the smarthost's own limit if that
    /// is higher.
    pub fn advertisable_size(&self, memory_limit: u64) -> u64 {
        let own = memory_limit * 150_000;
        self.extensions
            .observed_size
            .map_or(own, |server| own.max(server))
    }

    /// Sends the message held by `dsn` to every recipient whose action is
    /// still Unknown, updating each recipient with the outcome.
    ///
    /// On return either every recipient has a final action, or the
    /// remaining Unknown recipients have been marked Delayed by
    /// `finish()`. The client itself ends in `Rset` (reusable) or closed.
    pub async fn send(&mut self, dsn: &mut Dsn) {
        if !self.usable() {
            self.finish(dsn, "4.4.1");
            return;
        }

        info!(
            "{} Sending message{} from <{}>",
            self.log_prefix,
            dsn.message
                .message_id
                .as_deref()
                .map(|id| format!(" {id}"))
                .unwrap_or_default(),
            dsn.sender.lpdomain(),
        );

        let dotted = dotted(&dsn.message.rfc822);

        if !self.sent_helo {
            if let Err(failure) = self.run_greeting().await {
                let status = match failure {
                    ClientFailure::Gone(status) => status,
                    ClientFailure::Response => "4.4.1",
                };
                self.finish(dsn, status);
                self.closed = true;
                self.state = State::Invalid;
                return;
            }
        }

        match self.run_transaction(dsn, &dotted).await {
            Ok(()) => {},
            Err(ClientFailure::Response) => {
                // Recipient state already records the failure; fall
                // through to RSET below unless the server hung up on us.
            },
            Err(ClientFailure::Gone(status)) => {
                self.finish(dsn, status);
                self.closed = true;
                self.state = State::Invalid;
                return;
            },
        }

        // However the transaction went, any recipient not yet decided is
        // delayed, and the session returns to idle with RSET.
        self.finish(dsn, "4.5.0");
        match self.command_status("RSET").await {
            Ok(status) if (200..300).contains(&status.reply) => {
                self.state = State::Rset;
            },
            _ => {
                self.closed = true;
                self.state = State::Invalid;
            },
        }
    }

    /// Sends QUIT and closes. Used when an idle client's logout timer
    /// fires and at shutdown.
    pub async fn logout(&mut self) {
        if self.closed {
            return;
        }
        self.state = State::Quit;
        self.closed = true;
        debug!("{} Sending: QUIT", self.log_prefix);
        let _ = tokio::time::timeout(Duration::from_secs(10), async {
            let _ = self.io.write_all(b"QUIT\r\n").await;
            let _ = self.io.flush().await;
        })
        .await;
    }

    /// Reads the banner and negotiates EHLO, recording extensions.
    async fn run_greeting(&mut self) -> Result<(), ClientFailure> {
        let banner = self.read_responses(|_| {}).await?;
        if !(200..300).contains(&banner.reply) {
            self.error = Some(format!(
                "Smarthost rejected us at the banner: {}",
                banner.reply,
            ));
            return Err(ClientFailure::Gone("4.4.1"));
        }
        self.state = State::Banner;

        self.send_command(&format!("EHLO {}", self.local_host_name))
            .await?;
        self.state = State::Hello;

        let mut extensions = Extensions::default();
        let ehlo = self
            .read_responses(|line| record_extension(&mut extensions, line))
            .await?;
        if !(200..300).contains(&ehlo.reply) {
            self.error =
                Some(format!("Smarthost rejected EHLO: {}", ehlo.reply));
            return Err(ClientFailure::Gone("4.4.1"));
        }

        self.extensions = extensions;
        self.sent_helo = true;
        Ok(())
    }

    async fn run_transaction(
        &mut self,
        dsn: &mut Dsn,
        dotted: &[u8],
    ) -> Result<(), ClientFailure> {
        // MAIL FROM
        let mut command = String::from("MAIL FROM:<");
        if dsn.sender.address_type() == AddressType::Normal {
            command.push_str(&dsn.sender.lpdomain());
        }
        command.push('>');
        if dsn.message.needs_unicode && self.extensions.unicode {
            command.push_str(" SMTPUTF8");
        }
        if self.extensions.size {
            let _ = write!(command, " SIZE={}", dotted.len());
        }

        self.state = State::MailFrom;
        let status = self.command_status(&command).await?;
        if !(200..300).contains(&status.reply) {
            self.handle_failure(dsn, &status, ReplyPhase::MailFrom)?;
            return Err(ClientFailure::Response);
        }

        // RCPT TO, one per still-undecided recipient
        self.state = State::RcptTo;
        let mut accepted = Vec::<usize>::new();
        for ix in 0..dsn.recipients.len() {
            if dsn.recipients[ix].action != Action::Unknown {
                continue;
            }

            let command = format!(
                "RCPT TO:<{}>",
                dsn.recipients[ix].final_recipient.lpdomain(),
            );
            let status = self.command_status(&command).await?;
            let derived = enhanced_status(
                &status.line,
                self.extensions.enhanced_status_codes,
                ReplyPhase::RcptTo,
            );
            match status.reply {
                200..=299 => accepted.push(ix),
                400..=499 => {
                    dsn.recipients[ix].set_action(Action::Delayed, derived);
                },
                500..=599 => {
                    dsn.recipients[ix].set_action(Action::Failed, derived);
                },
                _ => {
                    dsn.recipients[ix].set_action(Action::Delayed, derived);
                },
            }
            if status.reply == 421 {
                return Err(ClientFailure::Gone("4.4.2"));
            }
        }

        if accepted.is_empty() {
            return Ok(());
        }

        // DATA
        self.state = State::Data;
        let status = self.command_status("DATA").await?;
        match status.reply {
            300..=399 => {},
            _ => {
                self.handle_failure(dsn, &status, ReplyPhase::Other)?;
                return Err(ClientFailure::Response);
            },
        }

        // Body. The deadline accounts for a 32kbps transfer rate, and the
        // chunked write extends it whenever the peer demonstrably drains
        // our output; a window with no progress at all is a stall.
        self.state = State::Body;
        debug!("{} Sending body", self.log_prefix);
        self.response_deadline = Instant::now()
            + RESPONSE_TIMEOUT
            + Duration::from_millis(dotted.len() as u64 / 4);
        self.write_body(dotted).await?;

        let status = self.command_status_no_send().await?;
        if !(200..300).contains(&status.reply) {
            self.handle_failure(dsn, &status, ReplyPhase::Other)?;
            return Err(ClientFailure::Response);
        }

        for &ix in &accepted {
            if dsn.recipients[ix].action == Action::Unknown {
                dsn.recipients[ix].set_action(Action::Relayed, "");
                info!(
                    "{} Sent to {}",
                    self.log_prefix,
                    dsn.recipients[ix].final_recipient.lpdomain(),
                );
            }
        }

        Ok(())
    }

    /// Applies a failure reply to the DSN.
    ///
    /// Everything still Unknown becomes Delayed (4xx) or Failed (5xx)
    /// with the derived enhanced status; a 421 additionally reports the
    /// whole connection as gone.
    fn handle_failure(
        &mut self,
        dsn: &mut Dsn,
        status: &ResponseStatus,
        phase: ReplyPhase,
    ) -> Result<(), ClientFailure> {
        let derived = enhanced_status(
            &status.line,
            self.extensions.enhanced_status_codes,
            phase,
        );
        let action = if status.reply >= 500 {
            Action::Failed
        } else {
            Action::Delayed
        };
        for recipient in &mut dsn.recipients {
            if recipient.action == Action::Unknown {
                recipient.set_action(action, derived.clone());
            }
        }
        self.state = State::Error;

        if status.reply == 421 {
            info!("{} Closing because the server sent 421", self.log_prefix);
            return Err(ClientFailure::Gone("4.4.2"));
        }

        Ok(())
    }

    /// Marks every remaining Unknown recipient Delayed with `status`.
    fn finish(&mut self, dsn: &mut Dsn, status: &str) {
        for recipient in &mut dsn.recipients {
            if recipient.action == Action::Unknown {
                recipient.set_action(Action::Delayed, status);
            }
        }
    }

    async fn send_command(
        &mut self,
        command: &str,
    ) -> Result<(), ClientFailure> {
        self.response_deadline = Instant::now() + RESPONSE_TIMEOUT;
        debug!("{} Sending: {command}", self.log_prefix);
        self.last_sent = command.to_owned();

        let io = async {
            self.io.write_all(command.as_bytes()).await?;
            self.io.write_all(b"\r\n").await?;
            self.io.flush().await?;
            std::io::Result::Ok(())
        };
        match tokio::time::timeout_at(self.response_deadline, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.error = Some(format!("I/O error sending command: {e}"));
                Err(ClientFailure::Gone("4.4.2"))
            },
            Err(_timeout) => {
                self.error = Some("Server timeout.".to_owned());
                Err(ClientFailure::Gone("4.4.1"))
            },
        }
    }

    async fn command_status(
        &mut self,
        command: &str,
    ) -> Result<ResponseStatus, ClientFailure> {
        self.send_command(command).await?;
        self.command_status_no_send().await
    }

    async fn command_status_no_send(
        &mut self,
    ) -> Result<ResponseStatus, ClientFailure> {
        self.read_responses(|_| {}).await
    }

    /// Reads response lines up to and including the final one, invoking
    /// `on_line` for each continuation line (for EHLO extension capture).
    async fn read_responses(
        &mut self,
        mut on_line: impl FnMut(&str),
    ) -> Result<ResponseStatus, ClientFailure> {
        for _ in 0..1000 {
            let line = self.read_line().await?;
            debug!("{} Received: {line}", self.log_prefix);

            let reply = line.get(..3).and_then(|s| s.parse::<u32>().ok());
            let separator = line.as_bytes().get(3).copied();
            match (reply, separator) {
                (Some(_), Some(b'-')) => on_line(&line),
                (Some(reply), Some(b' ')) | (Some(reply), None) => {
                    if reply < 200 || reply >= 600 {
                        self.error = Some(format!(
                            "Server sent unexpected response to {}: {line}",
                            self.last_sent,
                        ));
                    }
                    on_line(&line);
                    return Ok(ResponseStatus { reply, line });
                },
                _ => {
                    self.error =
                        Some(format!("Server sent garbage: {line}"));
                    return Err(ClientFailure::Gone("4.4.2"));
                },
            }
        }

        self.error = Some("Too many response lines".to_owned());
        Err(ClientFailure::Gone("4.4.2"))
    }

    /// Reads one CRLF (or LF) terminated line, without the line ending.
    async fn read_line(&mut self) -> Result<String, ClientFailure> {
        loop {
            if let Some(eol) = memchr::memchr(
                b'\n',
                &self.line_buffer[..self.line_buffer_len],
            ) {
                let mut end = eol;
                if end > 0 && self.line_buffer[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = String::from_utf8_lossy(&self.line_buffer[..end])
                    .into_owned();
                self.line_buffer
                    .copy_within(eol + 1..self.line_buffer_len, 0);
                self.line_buffer_len -= eol + 1;
                return Ok(line);
            }

            if self.line_buffer_len >= MAX_LINE {
                self.error = Some("Response line too long".to_owned());
                return Err(ClientFailure::Gone("4.4.2"));
            }

            let read = tokio::time::timeout_at(
                self.response_deadline,
                self.io.read(&mut self.line_buffer[self.line_buffer_len..]),
            )
            .await;
            match read {
                Err(_timeout) => {
                    warn!("{} SMTP server timed out", self.log_prefix);
                    self.error = Some("Server timeout.".to_owned());
                    return Err(ClientFailure::Gone("4.4.1"));
                },
                Ok(Err(e)) => {
                    self.error = Some(format!("I/O error: {e}"));
                    return Err(ClientFailure::Gone("4.4.2"));
                },
                Ok(Ok(0)) => {
                    warn!("{} Unexpected close by server", self.log_prefix);
                    self.error = Some("Unexpected close by server.".to_owned());
                    return Err(ClientFailure::Gone("4.4.2"));
                },
                Ok(Ok(n)) => self.line_buffer_len += n,
            }
        }
    }

    /// Writes the dotted body in chunks.
    ///
    /// Each chunk that the transport accepts within its window counts as
    /// progress and pushes the stall deadline out; a chunk that sits
    /// undeliverable for the whole window fails the attempt with 4.4.1.
    async fn write_body(&mut self, dotted: &[u8]) -> Result<(), ClientFailure> {
        const CHUNK: usize = 8192;
        const PROGRESS_WINDOW: Duration = Duration::from_secs(60);

        for chunk in dotted.chunks(CHUNK) {
            let deadline =
                self.response_deadline.min(Instant::now() + PROGRESS_WINDOW);
            let io = async {
                self.io.write_all(chunk).await?;
                self.io.flush().await?;
                std::io::Result::Ok(())
            };
            match tokio::time::timeout_at(deadline, io).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    self.error =
                        Some(format!("I/O error sending body: {e}"));
                    return Err(ClientFailure::Gone("4.4.2"));
                },
                Err(_timeout) => {
                    warn!(
                        "{} No write progress to SMTP server",
                        self.log_prefix,
                    );
                    self.error = Some("Server timeout.".to_owned());
                    return Err(ClientFailure::Gone("4.4.1"));
                },
            }
        }

        Ok(())
    }
}

struct ResponseStatus {
    reply: u32,
    line: String,
}

enum ClientFailure {
    /// The reply decided the fate of the transaction but the connection
    /// remains usable.
    Response,
    /// The connection is no longer usable; pending recipients get this
    /// status.
    Gone(&'static str),
}

fn record_extension(extensions: &mut Extensions, line: &str) {
    // Strip the "250-" / "250 " prefix.
    let keyword_line = line.get(4..).unwrap_or("").trim();
    let mut words = keyword_line.split_ascii_whitespace();
    let Some(keyword) = words.next() else { return };

    if keyword.eq_ignore_ascii_case("ENHANCEDSTATUSCODES") {
        extensions.enhanced_status_codes = true;
    } else if keyword.eq_ignore_ascii_case("SMTPUTF8") {
        extensions.unicode = true;
    } else if keyword.eq_ignore_ascii_case("SIZE") {
        extensions.size = true;
        extensions.observed_size =
            words.next().and_then(|w| w.parse::<u64>().ok()).filter(|&s| s > 0);
    }
}

/// Returns a dot-stuffed copy of `s` with a final `.CRLF` appended.
///
/// Lone CR and lone LF are normalised to CRLF on the way through.
pub fn dotted(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 8);
    let mut i = 0;
    let mut start_of_line = true;

    while i < s.len() {
        match s[i] {
            b'\r' => {
                start_of_line = true;
                out.extend_from_slice(b"\r\n");
                if s.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
            },
            b'\n' => {
                start_of_line = true;
                out.extend_from_slice(b"\r\n");
            },
            c => {
                if start_of_line && c == b'.' {
                    out.push(b'.');
                }
                out.push(c);
                start_of_line = false;
            },
        }
        i += 1;
    }

    if !start_of_line {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// The idle-client pool.
///
/// At most one client lingers for the long idle period; any further
/// clients released while one is already idle are logged out after a
/// short grace. Acquisition returns the first client in `Rset`.
#[derive(Clone)]
pub struct ClientPool {
    inner: Rc<RefCell<PoolInner>>,
}

struct PoolInner {
    idle: Vec<(u64, Rc<RefCell<SmtpClient>>)>,
    next_token: u64,
}

impl ClientPool {
    pub fn new() -> Self {
        ClientPool {
            inner: Rc::new(RefCell::new(PoolInner {
                idle: Vec::new(),
                next_token: 0,
            })),
        }
    }

    /// Takes the first idle client able to start a transaction, if any.
    pub fn acquire(&self) -> Option<Rc<RefCell<SmtpClient>>> {
        let mut inner = self.inner.borrow_mut();
        let position = inner
            .idle
            .iter()
            .position(|(_, c)| c.borrow().usable());
        let found = position.map(|ix| inner.idle.remove(ix).1);
        // Anything unusable left behind is of no further interest.
        inner.idle.retain(|(_, c)| c.borrow().usable());
        found
    }

    /// Returns a client to the pool and arms its logout timer.
    pub fn release(&self, client: Rc<RefCell<SmtpClient>>) {
        if !client.borrow().usable() {
            return;
        }

        let (token, timeout) = {
            let mut inner = self.inner.borrow_mut();
            let token = inner.next_token;
            inner.next_token += 1;
            let timeout = if inner.idle.is_empty() {
                IDLE_LOGOUT
            } else {
                EXTRA_IDLE_LOGOUT
            };
            inner.idle.push((token, Rc::clone(&client)));
            (token, timeout)
        };

        let pool = self.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            let client = {
                let mut inner = pool.inner.borrow_mut();
                let position =
                    inner.idle.iter().position(|&(t, _)| t == token);
                position.map(|ix| inner.idle.remove(ix).1)
            };
            if let Some(client) = client {
                client.borrow_mut().logout().await;
            }
        });
    }

    /// Logs out every idle client immediately.
    pub async fn shutdown(&self) {
        let idle = std::mem::take(&mut self.inner.borrow_mut().idle);
        for (_, client) in idle {
            client.borrow_mut().logout().await;
        }
    }
}
