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

//! Attempts delivery of one queued message and writes the per-recipient
//! outcome back to the deliveries tables.
//!
//! Everything an agent does to the store happens inside one transaction,
//! opened with `SELECT ... FOR UPDATE` so no two agents ever work on the
//! same message, and committed exactly once. If that commit cannot be
//! made, the spool manager is shut down rather than risk sending the same
//! message twice.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::prelude::*;
use log::{error, info};
use tokio::sync::mpsc;

use crate::db::{Pool, Query, Value};
use crate::smtp::dsn::{
    Action, Address, AddressType, Dsn, Message, Recipient,
};
use crate::smtp::outbound::{ClientPool, SmtpClient};
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

/// Where undeliverable-mail reports are spooled from.
pub const SPOOL_MAILBOX: &str = "/archiveopteryx/spool";

/// What a finished agent reports back to the spool manager.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub message: i64,
    /// Every sender row was counted and every counted row ended all-ok,
    /// so the spooled copy can be deleted.
    pub delivered: bool,
    /// The status writeback could not be committed; the manager must
    /// stop the spool to avoid duplicate deliveries.
    pub commit_failed: bool,
    /// A bounce was spooled, so the queue should be re-scanned.
    pub injected_bounce: bool,
}

pub struct DeliveryAgent {
    pool: Pool,
    clients: ClientPool,
    config: Rc<SystemConfig>,
    log_prefix: LogPrefix,
    message: i64,
}

impl DeliveryAgent {
    pub fn new(
        pool: Pool,
        clients: ClientPool,
        config: Rc<SystemConfig>,
        log_prefix: LogPrefix,
        message: i64,
    ) -> Self {
        DeliveryAgent {
            pool,
            clients,
            config,
            log_prefix,
            message,
        }
    }

    /// Runs the delivery attempt to completion.
    pub async fn run(self) -> Outcome {
        info!(
            "{} Starting delivery attempt for message {}",
            self.log_prefix, self.message,
        );

        let (waker, mut woken) = mpsc::unbounded_channel();
        let mut outcome = Outcome {
            message: self.message,
            delivered: false,
            commit_failed: false,
            injected_bounce: false,
        };

        // Fetch and lock all pending deliveries for this message.
        let tx = self.pool.transaction();
        let qm = Query::new(
            "select id, sender, \
             current_timestamp > expires_at as expired, \
             (tried_at is null or tried_at+interval '1 hour'\
             < current_timestamp) as can_retry \
             from deliveries where message=$1 for update",
            vec![Value::Int(self.message)],
        );
        tx.enqueue(&qm);
        tx.execute(&waker);
        await_query(&qm, &mut woken).await;

        if qm.failed() {
            error!(
                "{} Could not lock deliveries: {}",
                self.log_prefix,
                qm.error().unwrap_or_default(),
            );
            tx.rollback();
            return outcome;
        }

        let mut senders = 0u32;
        let mut sent = 0u32;
        let mut client: Option<Rc<RefCell<SmtpClient>>> = None;

        while let Some(delivery_row) = qm.next_row() {
            senders += 1;
            if !delivery_row.get_bool("can_retry") {
                continue;
            }

            let delivery = delivery_row.get_int("id");
            let expired = !delivery_row.is_null("expired")
                && delivery_row.get_bool("expired");

            let Some(mut dsn) = self
                .load_dsn(&tx, &delivery_row, delivery, &waker, &mut woken)
                .await
            else {
                continue;
            };

            for r in &dsn.recipients {
                if r.action == Action::Unknown {
                    info!(
                        "{} Attempting delivery to {}",
                        self.log_prefix,
                        r.final_recipient.lpdomain(),
                    );
                }
            }

            if expired {
                // The queue has given up on this message; whoever is
                // still undecided fails with the delivery-time-expired
                // status.
                for r in &mut dsn.recipients {
                    if r.action == Action::Unknown {
                        r.set_action(Action::Failed, "4.4.7");
                    }
                }
            } else if dsn.deliveries_pending() {
                let c = match client.take() {
                    Some(c) if c.borrow().usable() => c,
                    _ => match self.provide_client().await {
                        Some(c) => c,
                        None => {
                            // Connection failure: everyone waits for the
                            // next queue run.
                            for r in &mut dsn.recipients {
                                if r.action == Action::Unknown {
                                    r.set_action(Action::Delayed, "4.4.1");
                                }
                            }
                            self.enqueue_updates(&tx, delivery, &dsn);
                            continue;
                        },
                    },
                };

                c.borrow_mut().send(&mut dsn).await;
                client = Some(c);
            }

            if dsn.all_ok() {
                sent += 1;
            } else if dsn.sender.address_type() == AddressType::Normal {
                self.inject_bounce(&tx, &dsn, &waker, &mut woken).await;
                outcome.injected_bounce = true;
            }

            self.enqueue_updates(&tx, delivery, &dsn);
        }

        // One commit per message, no matter how many deliveries were
        // processed above.
        tx.commit(&waker);
        while !tx.done() {
            if woken.recv().await.is_none() {
                break;
            }
        }

        if tx.failed() {
            error!(
                "{} Delivery attempt failed due to database error: {}",
                self.log_prefix,
                tx.error().unwrap_or_default(),
            );
            outcome.commit_failed = true;
            if let Some(client) = client.take() {
                self.clients.release(client);
            }
            return outcome;
        }

        if let Some(client) = client.take() {
            self.clients.release(client);
        }

        outcome.delivered = senders == sent;
        info!(
            "{} Delivery attempt done; {} of {} deliveries sent",
            self.log_prefix, sent, senders,
        );
        outcome
    }

    /// Assembles the DSN for one delivery row: the message text, the
    /// sender address, and one Recipient per delivery_recipients row.
    async fn load_dsn(
        &self,
        tx: &crate::db::Transaction,
        delivery_row: &crate::db::Row,
        delivery: i64,
        waker: &mpsc::UnboundedSender<()>,
        woken: &mut mpsc::UnboundedReceiver<()>,
    ) -> Option<Dsn> {
        let qt = Query::new(
            "select header, body from messages where id=$1",
            vec![Value::Int(self.message)],
        );
        // The sender address is fetched separately because we don't (and
        // should not) have UPDATE privileges on addresses, so it can't be
        // joined into the locking query.
        let qs = Query::new(
            "select localpart, domain from addresses where id=$1",
            vec![Value::Int(delivery_row.get_int("sender"))],
        );
        let qr = Query::new(
            "select recipient, localpart, domain, action, status, \
             extract(epoch from last_attempt)::bigint as last_attempt \
             from delivery_recipients join addresses \
             on (recipient=addresses.id) \
             where delivery=$1",
            vec![Value::Int(delivery)],
        );
        tx.enqueue(&qt);
        tx.enqueue(&qs);
        tx.enqueue(&qr);
        tx.execute(waker);
        await_query(&qr, woken).await;

        if qt.failed() || qs.failed() || qr.failed() {
            error!("{} Could not load message or addresses", self.log_prefix);
            return None;
        }

        let text_row = qt.next_row()?;
        if text_row.is_null("header") || text_row.is_null("body") {
            error!(
                "{} Message {} has no stored text",
                self.log_prefix, self.message,
            );
            return None;
        }
        let rfc822 = format!(
            "{}\r\n{}",
            text_row.get_text("header"),
            text_row.get_text("body"),
        );
        let message = Rc::new(Message::new(rfc822.into_bytes()));

        let sender_row = qs.next_row()?;
        let sender = Address::new(
            sender_row.get_text("localpart"),
            sender_row.get_text("domain"),
        );

        let mut dsn = Dsn::new(message, sender);
        while let Some(r) = qr.next_row() {
            let mut address =
                Address::new(r.get_text("localpart"), r.get_text("domain"));
            address.id = Some(r.get_int("recipient"));

            let mut recipient = Recipient::new(address);
            recipient.action = Action::from_db(r.get_int("action"));
            recipient.status = if r.is_null("status") {
                String::new()
            } else {
                r.get_text("status").to_owned()
            };
            if !r.is_null("last_attempt") {
                recipient.last_attempt = Utc
                    .timestamp_opt(r.get_int("last_attempt"), 0)
                    .single();
            }
            dsn.add_recipient(recipient);
        }

        Some(dsn)
    }

    /// Provides a working SMTP client: the idle one if the pool has one,
    /// else a fresh connection to the smarthost.
    async fn provide_client(&self) -> Option<Rc<RefCell<SmtpClient>>> {
        if let Some(client) = self.clients.acquire() {
            return Some(client);
        }

        let (address, port) = self.config.smart_host();
        match SmtpClient::connect(
            self.log_prefix.deep_clone(),
            &address,
            port,
            self.config.hostname.clone(),
        )
        .await
        {
            Ok(client) => Some(Rc::new(RefCell::new(client))),
            Err(e) => {
                error!(
                    "{} Could not connect to smarthost: {e}",
                    self.log_prefix,
                );
                None
            },
        }
    }

    /// Spools a nondelivery report to the original sender, with the empty
    /// envelope sender so it can never itself bounce.
    async fn inject_bounce(
        &self,
        tx: &crate::db::Transaction,
        dsn: &Dsn,
        waker: &mpsc::UnboundedSender<()>,
        woken: &mut mpsc::UnboundedReceiver<()>,
    ) {
        info!(
            "{} Spooling bounce to {}",
            self.log_prefix,
            dsn.sender.lpdomain(),
        );

        let report = dsn.bounce_text(&self.config.hostname);
        let qi = Query::new(
            "insert into messages (header, body) values ($1, $2) \
             returning id",
            split_message(&report),
        );
        tx.enqueue(&qi);
        tx.execute(waker);
        await_query(&qi, woken).await;

        let Some(id_row) = qi.next_row() else {
            error!("{} Could not spool bounce message", self.log_prefix);
            return;
        };
        let bounce_message = id_row.get_int("id");

        let qd = Query::new(
            "insert into deliveries \
             (message, sender, injected_at, expires_at) \
             select $1, null, current_timestamp, \
             current_timestamp+interval '900 s' \
             from mailboxes where name=$2 \
             returning id",
            vec![
                Value::Int(bounce_message),
                Value::Text(SPOOL_MAILBOX.to_owned()),
            ],
        );
        tx.enqueue(&qd);
        tx.execute(waker);
        await_query(&qd, woken).await;

        let Some(delivery_row) = qd.next_row() else {
            error!(
                "{} Could not spool bounce: no {} mailbox",
                self.log_prefix, SPOOL_MAILBOX,
            );
            return;
        };

        let qr = Query::new(
            "insert into delivery_recipients (delivery, recipient) \
             values ($1, $2)",
            vec![
                Value::Int(delivery_row.get_int("id")),
                dsn.sender.id.map(Value::Int).unwrap_or(Value::Null),
            ],
        );
        tx.enqueue(&qr);
    }

    fn enqueue_updates(
        &self,
        tx: &crate::db::Transaction,
        delivery: i64,
        dsn: &Dsn,
    ) {
        tx.enqueue(&Query::new(
            "update deliveries set tried_at=current_timestamp where id=$1",
            vec![Value::Int(delivery)],
        ));

        let mut handled = 0u32;
        let mut unhandled = 0u32;
        for r in &dsn.recipients {
            if r.action == Action::Unknown {
                unhandled += 1;
                continue;
            }
            handled += 1;
            tx.enqueue(&Query::new(
                "update delivery_recipients \
                 set action=$1, status=$2, last_attempt=current_timestamp \
                 where delivery=$3 and recipient=$4",
                vec![
                    Value::Int(r.action.to_db()),
                    Value::Text(r.status.clone()),
                    Value::Int(delivery),
                    r.final_recipient.id.map(Value::Int).unwrap_or(Value::Null),
                ],
            ));
        }

        info!(
            "{} Recipients handled: {handled}, still queued: {unhandled}",
            self.log_prefix,
        );
    }
}

/// Splits an RFC 822 message into (header, body) bind values at the first
/// blank line.
fn split_message(rfc822: &[u8]) -> Vec<Value> {
    let text = String::from_utf8_lossy(rfc822);
    match text.find("\r\n\r\n") {
        Some(ix) => vec![
            Value::Text(text[..ix].to_owned()),
            Value::Text(text[ix + 4..].to_owned()),
        ],
        None => vec![Value::Text(text.into_owned()), Value::Text(String::new())],
    }
}

async fn await_query(
    query: &Query,
    woken: &mut mpsc::UnboundedReceiver<()>,
) {
    while !query.done() {
        if woken.recv().await.is_none() {
            return;
        }
    }
}
