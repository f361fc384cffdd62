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

//! The periodic controller which drains the deliveries table.
//!
//! One spool manager runs per process. It wakes when the store signals
//! `deliveries_updated`, when a delivery agent finishes, or when the
//! earliest retry falls due, and on each wake-up spawns one DeliveryAgent
//! per deliverable message. The `shutdown()` kill switch stops all new
//! delivery work permanently; it exists so that a store which cannot
//! record "already sent" can never cause the same message to be sent over
//! and over.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::mpsc;

use super::agent::{DeliveryAgent, Outcome, SPOOL_MAILBOX};
use super::SPOOL_INTERVAL;
use crate::db::{Pool, Query, Value};
use crate::smtp::dsn::Action;
use crate::smtp::outbound::ClientPool;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

#[derive(Clone)]
pub struct SpoolManager {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    pool: Pool,
    clients: ClientPool,
    config: Rc<SystemConfig>,
    log_prefix: LogPrefix,
    shutdown: bool,
    again: bool,
    working: HashSet<i64>,
    next_agent_id: u64,
    agent_tx: mpsc::UnboundedSender<Outcome>,
    wake_tx: mpsc::UnboundedSender<()>,
}

impl SpoolManager {
    pub fn new(
        pool: Pool,
        clients: ClientPool,
        config: Rc<SystemConfig>,
    ) -> (Self, ManagerChannels) {
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        (
            SpoolManager {
                inner: Rc::new(RefCell::new(Inner {
                    pool,
                    clients,
                    config,
                    log_prefix: LogPrefix::new("spool".to_owned(), 0),
                    shutdown: false,
                    again: false,
                    working: HashSet::new(),
                    next_agent_id: 0,
                    agent_tx,
                    wake_tx,
                })),
            },
            ManagerChannels { agent_rx, wake_rx },
        )
    }

    /// The kill switch. Stops all future delivery work; in-flight agents
    /// finish on their own, and their failures merely re-trigger this.
    pub fn shutdown(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.shutdown {
            return;
        }
        inner.shutdown = true;
        error!(
            "{} Shutting down outgoing mail due to software problem",
            inner.log_prefix,
        );
        let _ = inner.wake_tx.send(());
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.borrow().shutdown
    }

    /// Requests another queue run as soon as the current one finishes.
    pub fn deliver_new_message(&self) {
        let mut inner = self.inner.borrow_mut();
        debug!(
            "{} New message added to spool; will deliver when possible",
            inner.log_prefix,
        );
        inner.again = true;
        let _ = inner.wake_tx.send(());
    }

    /// Runs the controller until `shutdown()`.
    pub async fn run(&self, mut channels: ManagerChannels) {
        let (pool, log_prefix) = {
            let inner = self.inner.borrow();
            (inner.pool.clone(), inner.log_prefix.clone())
        };
        let mut notifications = pool.listen("deliveries_updated");
        let (waker, mut woken) = mpsc::unbounded_channel();

        // Anything still pending from a previous run gets a fresh expiry
        // horizon, so a long downtime doesn't expire the whole queue.
        let refresh = Query::new(
            "update deliveries \
             set expires_at=current_timestamp+interval '900 s' \
             where expires_at<current_timestamp+interval '900 s' \
             and id in \
             (select delivery from delivery_recipients \
             where action=$1 or action=$2)",
            vec![
                Value::Int(Action::Unknown.to_db()),
                Value::Int(Action::Delayed.to_db()),
            ],
        );
        pool.execute(&refresh, waker.clone());
        while !refresh.done() {
            if woken.recv().await.is_none() {
                return;
            }
        }

        loop {
            if self.is_shut_down() {
                break;
            }

            self.inner.borrow_mut().again = false;
            let delay = self.queue_run(&waker, &mut woken).await;

            if self.is_shut_down() {
                break;
            }
            if self.inner.borrow().again {
                continue;
            }

            if let Some(delay) = delay {
                info!(
                    "{} Will process the queue again in {} seconds",
                    log_prefix,
                    delay.as_secs(),
                );
            }

            tokio::select! {
                _ = notifications.recv() => {
                    self.inner.borrow_mut().again = true;
                },
                outcome = channels.agent_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.harvest(outcome, &waker);
                    }
                },
                _ = channels.wake_rx.recv() => {},
                _ = async {
                    match delay {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending().await,
                    }
                } => {},
            }

            // Drain whatever else arrived while we were waiting.
            while let Ok(outcome) = channels.agent_rx.try_recv() {
                self.harvest(outcome, &waker);
            }
            while notifications.try_recv().is_ok() {}
            while channels.wake_rx.try_recv().is_ok() {}
        }

        info!("{} Spool manager stopped", log_prefix);
    }

    /// One queue sweep: query the earliest next-attempt time per message,
    /// spawn an agent for everything already due, and return the delay
    /// until the next message falls due.
    async fn queue_run(
        &self,
        waker: &mpsc::UnboundedSender<()>,
        woken: &mut mpsc::UnboundedReceiver<()>,
    ) -> Option<Duration> {
        let (pool, log_prefix, have) = {
            let inner = self.inner.borrow();
            (
                inner.pool.clone(),
                inner.log_prefix.clone(),
                inner.working.iter().copied().collect::<Vec<i64>>(),
            )
        };

        debug!("{} Starting queue run", log_prefix);

        let mut delay: Option<u32> = if have.is_empty() {
            None
        } else {
            Some(SPOOL_INTERVAL)
        };

        let mut sql = String::from(
            "select d.message, \
             extract(epoch from\
             min(coalesce(dr.last_attempt+interval '900 s',\
             d.deliver_after,\
             current_timestamp)))::bigint\
             -extract(epoch from current_timestamp)::bigint as delay \
             from deliveries d \
             join delivery_recipients dr on (d.id=dr.delivery) \
             where (dr.action=$1 or dr.action=$2) ",
        );
        let mut params = vec![
            Value::Int(Action::Unknown.to_db()),
            Value::Int(Action::Delayed.to_db()),
        ];
        if !have.is_empty() {
            sql.push_str("and not d.message=any($3) ");
            params.push(Value::IntSet(have));
        }
        sql.push_str("group by d.message order by delay");

        let q = Query::new(sql, params);
        pool.execute(&q, waker.clone());
        while !q.done() {
            if woken.recv().await.is_none() {
                return None;
            }
        }

        if q.failed() {
            error!(
                "{} Queue scan failed: {}",
                log_prefix,
                q.error().unwrap_or_default(),
            );
            return delay.map(|d| Duration::from_secs(u64::from(d)));
        }

        if q.rows() == 0 {
            debug!("{} Ending queue run", log_prefix);
            return delay.map(|d| Duration::from_secs(u64::from(d)));
        }

        while let Some(row) = q.next_row() {
            let deliverable_at = row.get_int("delay");
            if deliverable_at <= 0 {
                self.spawn_agent(row.get_int("message"));
            } else if delay.is_none()
                || i64::from(delay.unwrap()) > deliverable_at
            {
                delay = Some(deliverable_at as u32);
            }
        }

        delay.map(|d| Duration::from_secs(u64::from(d)))
    }

    /// Spawns a DeliveryAgent for `message`, staggered so a burst of due
    /// messages does not open a connection storm.
    fn spawn_agent(&self, message: i64) {
        let mut inner = self.inner.borrow_mut();
        if inner.shutdown || !inner.working.insert(message) {
            return;
        }

        let stagger =
            Duration::from_secs(5 * (inner.working.len() as u64 - 1));
        inner.next_agent_id += 1;
        let agent = DeliveryAgent::new(
            inner.pool.clone(),
            inner.clients.clone(),
            Rc::clone(&inner.config),
            LogPrefix::new("spool".to_owned(), inner.next_agent_id),
            message,
        );
        let agent_tx = inner.agent_tx.clone();

        tokio::task::spawn_local(async move {
            tokio::time::sleep(stagger).await;
            let outcome = agent.run().await;
            let _ = agent_tx.send(outcome);
        });
    }

    /// Handles one finished agent.
    fn harvest(&self, outcome: Outcome, waker: &mpsc::UnboundedSender<()>) {
        let pool = {
            let mut inner = self.inner.borrow_mut();
            inner.working.remove(&outcome.message);
            inner.again = true;
            inner.pool.clone()
        };

        if outcome.commit_failed {
            self.shutdown();
            return;
        }

        if outcome.delivered {
            // The spooled copy has served its purpose.
            let delete = Query::new(
                "insert into deleted_messages (mailbox, uid, reason) \
                 select mm.mailbox, mm.uid, 'delivered' \
                 from mailbox_messages mm \
                 join mailboxes mb on (mm.mailbox=mb.id) \
                 where mm.message=$1 and mb.name=$2",
                vec![
                    Value::Int(outcome.message),
                    Value::Text(SPOOL_MAILBOX.to_owned()),
                ],
            );
            pool.execute(&delete, waker.clone());
        }
    }
}

pub struct ManagerChannels {
    agent_rx: mpsc::UnboundedReceiver<Outcome>,
    wake_rx: mpsc::UnboundedReceiver<()>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::testing::ScriptedBackend;
    use crate::db::run_backend;
    use crate::db_row;

    fn config() -> Rc<SystemConfig> {
        Rc::new(
            SystemConfig::load(
                "hostname = \"mx.earth.com\"\n\
                 smart-host-address = \"127.0.0.1\"\n",
            )
            .unwrap(),
        )
    }

    struct Setup {
        manager: SpoolManager,
        channels: ManagerChannels,
        log: Rc<RefCell<Vec<String>>>,
    }

    fn set_up(backend: ScriptedBackend) -> Setup {
        let log = backend.log();
        let (pool, rx) = Pool::new();
        tokio::task::spawn_local(run_backend(backend, rx));
        let (manager, channels) =
            SpoolManager::new(pool, ClientPool::new(), config());
        Setup {
            manager,
            channels,
            log,
        }
    }

    #[test]
    fn future_delivery_arms_timer_without_spawning() {
        run_future_delivery();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_future_delivery() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // One message whose earliest attempt is 30 minutes out.
                let backend = ScriptedBackend::new().on(
                    "group by d.message",
                    vec![db_row! { "message" => 9i64, "delay" => 1800i64 }],
                );
                let setup = set_up(backend);

                let (waker, mut woken) = mpsc::unbounded_channel();
                let delay = setup
                    .manager
                    .queue_run(&waker, &mut woken)
                    .await;

                assert_eq!(Some(Duration::from_secs(1800)), delay);
                // No agent was spawned, so nothing tried to lock rows.
                assert!(!setup
                    .log
                    .borrow()
                    .iter()
                    .any(|s| s.contains("for update")));
            })
            .await;
    }

    #[test]
    fn due_delivery_spawns_agent_and_cleans_spool() {
        run_due_delivery();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_due_delivery() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // One due message; the agent finds no lockable rows (all
                // already handled), which counts as delivered and lets
                // the manager clean up the spool copy.
                let backend = ScriptedBackend::new().on(
                    "group by d.message",
                    vec![db_row! { "message" => 9i64, "delay" => -5i64 }],
                );
                let setup = set_up(backend);

                let manager = setup.manager.clone();
                let mut channels = setup.channels;
                let (waker, mut woken) = mpsc::unbounded_channel();
                let delay =
                    manager.queue_run(&waker, &mut woken).await;
                // The in-flight agent keeps the retry horizon armed.
                assert_eq!(
                    Some(Duration::from_secs(u64::from(SPOOL_INTERVAL))),
                    delay,
                );

                let outcome =
                    channels.agent_rx.recv().await.expect("no outcome");
                assert!(outcome.delivered);
                manager.harvest(outcome, &waker);

                // Let the deletion query reach the backend.
                tokio::task::yield_now().await;
                tokio::task::yield_now().await;

                let log = setup.log.borrow();
                assert!(log.iter().any(|s| s.contains("for update")));
                assert!(log
                    .iter()
                    .any(|s| s.contains("insert into deleted_messages")));
            })
            .await;
    }

    #[test]
    fn commit_failure_trips_the_kill_switch() {
        run_commit_failure();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_commit_failure() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // A due message whose lock row is not yet retryable: the
                // agent skips it but still commits, and the commit fails.
                let backend = ScriptedBackend::new()
                    .failing_commits()
                    .on(
                        "group by d.message",
                        vec![db_row! { "message" => 9i64, "delay" => 0i64 }],
                    )
                    .on(
                        "for update",
                        vec![db_row! {
                            "id" => 7i64,
                            "sender" => 100i64,
                            "expired" => false,
                            "can_retry" => false,
                        }],
                    );
                let setup = set_up(backend);

                let manager = setup.manager.clone();
                let mut channels = setup.channels;
                let (waker, mut woken) = mpsc::unbounded_channel();
                manager.queue_run(&waker, &mut woken).await;

                let outcome =
                    channels.agent_rx.recv().await.expect("no outcome");
                assert!(outcome.commit_failed);
                manager.harvest(outcome, &waker);

                assert!(manager.is_shut_down());

                // Once shut down, nothing spawns any more.
                manager.spawn_agent(11);
                assert!(manager.inner.borrow().working.is_empty());
            })
            .await;
    }

    #[test]
    fn notification_triggers_another_run() {
        run_notification();
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_notification() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend = ScriptedBackend::new();
                let setup = set_up(backend);

                let manager = setup.manager.clone();
                let pool = manager.inner.borrow().pool.clone();
                let run = tokio::task::spawn_local({
                    let manager = manager.clone();
                    async move { manager.run(setup.channels).await }
                });

                // Let the startup refresh and first sweep complete.
                tokio::time::sleep(Duration::from_millis(10)).await;
                let sweeps_before = count_sweeps(&setup.log);
                assert!(sweeps_before >= 1);

                pool.notify("deliveries_updated");
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(count_sweeps(&setup.log) > sweeps_before);

                manager.shutdown();
                let _ = run.await;
            })
            .await;
    }

    fn count_sweeps(log: &Rc<RefCell<Vec<String>>>) -> usize {
        log.borrow()
            .iter()
            .filter(|s| s.contains("group by d.message"))
            .count()
    }
}
