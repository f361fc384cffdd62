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

//! `aox delete-user`.

use std::rc::Rc;

use tokio::sync::mpsc;

use crate::db::postgres::{run_postgres, PostgresConfig};
use crate::db::{Pool, Query, Value};
use crate::support::error::Error;
use crate::support::system_config::SystemConfig;

pub fn delete_user(
    config: SystemConfig,
    login: &str,
    force: bool,
) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(delete_user_inner(
        Rc::new(config),
        login,
        force,
    )))
}

async fn delete_user_inner(
    config: Rc<SystemConfig>,
    login: &str,
    force: bool,
) -> Result<(), Error> {
    let (pool, requests) = Pool::new();
    let postgres = PostgresConfig {
        address: config.db_address.clone(),
        port: config.db_port,
        database: config.db_name.clone(),
        user: config.db_user.clone(),
        password: config.db_password.clone(),
    };
    {
        let pool = pool.clone();
        tokio::task::spawn_local(async move {
            let _ = run_postgres(postgres, pool, requests).await;
        });
    }

    let (waker, mut woken) = mpsc::unbounded_channel();

    let exists = Query::new(
        "select id from users where login=$1",
        vec![Value::Text(login.to_owned())],
    );
    pool.execute(&exists, waker.clone());
    while !exists.done() {
        if woken.recv().await.is_none() {
            return Err(Error::DatabaseUnavailable);
        }
    }
    if exists.failed() {
        return Err(Error::Database(exists.error().unwrap_or_default()));
    }
    let Some(row) = exists.next_row() else {
        return Err(Error::NxUser);
    };
    let user_id = row.get_int("id");

    if !force {
        let count = Query::new(
            "select count(*)::bigint as messages \
             from mailbox_messages mm \
             join mailboxes mb on (mm.mailbox=mb.id) \
             where mb.owner=$1",
            vec![Value::Int(user_id)],
        );
        pool.execute(&count, waker.clone());
        while !count.done() {
            if woken.recv().await.is_none() {
                return Err(Error::DatabaseUnavailable);
            }
        }
        let messages = count
            .next_row()
            .map(|row| row.get_int("messages"))
            .unwrap_or(0);
        if messages > 0 {
            eprintln!(
                "{login} still has {messages} messages; \
                 use -f to delete the mail too",
            );
            std::process::exit(-1);
        }
    }

    let tx = pool.transaction();
    tx.enqueue(&Query::new(
        "delete from mailbox_messages where mailbox in \
         (select id from mailboxes where owner=$1)",
        vec![Value::Int(user_id)],
    ));
    tx.enqueue(&Query::new(
        "delete from mailboxes where owner=$1",
        vec![Value::Int(user_id)],
    ));
    tx.enqueue(&Query::new(
        "delete from users where id=$1",
        vec![Value::Int(user_id)],
    ));
    tx.commit(&waker);
    while !tx.done() {
        if woken.recv().await.is_none() {
            return Err(Error::DatabaseUnavailable);
        }
    }
    if tx.failed() {
        return Err(Error::Database(tx.error().unwrap_or_default()));
    }

    println!("Deleted user {login}");
    Ok(())
}
