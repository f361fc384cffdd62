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

//! The `aox serve` subcommand: one event loop carrying the IMAP, LMTP,
//! and submission listeners, the spool manager, and the store worker.

use std::cell::Cell;
use std::rc::Rc;

use log::{error, info, warn};
use tokio::net::TcpListener;

use crate::db::postgres::{run_postgres, PostgresConfig};
use crate::db::Pool;
use crate::smtp::inbound::Dialect;
use crate::smtp::outbound::ClientPool;
use crate::spool::SpoolManager;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::{ListenAddress, SystemConfig};

pub fn serve(config: SystemConfig) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(serve_inner(Rc::new(config))))
}

async fn serve_inner(config: Rc<SystemConfig>) -> Result<(), Error> {
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
            if let Err(e) = run_postgres(postgres, pool, requests).await {
                error!("Database worker failed: {e}");
            }
        });
    }

    let clients = ClientPool::new();
    let (manager, channels) =
        SpoolManager::new(pool.clone(), clients, Rc::clone(&config));
    {
        let manager = manager.clone();
        tokio::task::spawn_local(async move {
            manager.run(channels).await;
        });
    }

    let shutting_down = Rc::new(Cell::new(false));
    let next_connection_id = Rc::new(Cell::new(0u64));

    spawn_imap_listener(
        &config,
        &pool,
        &shutting_down,
        &next_connection_id,
    )
    .await?;
    spawn_smtp_listener(
        &config,
        &pool,
        &shutting_down,
        &next_connection_id,
        Dialect::Lmtp,
        config.lmtp_address.clone(),
        config.lmtp_port,
    )
    .await?;
    spawn_smtp_listener(
        &config,
        &pool,
        &shutting_down,
        &next_connection_id,
        Dialect::Submit,
        config.submit_address.clone(),
        config.submit_port,
    )
    .await?;

    info!("{} ready", config.hostname);
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutting_down.set(true);
    manager.shutdown();

    // Give the sessions a moment to say their goodbyes.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    Ok(())
}

async fn bind(
    address: &ListenAddress,
    port: u16,
) -> Result<Option<TcpListener>, Error> {
    match address.socket_addr(port) {
        Some(addr) => Ok(Some(TcpListener::bind(addr).await?)),
        None => {
            warn!(
                "Listening on {address} is not supported; \
                 use an IPv4 or IPv6 address",
            );
            Ok(None)
        },
    }
}

async fn spawn_imap_listener(
    config: &Rc<SystemConfig>,
    pool: &Pool,
    shutting_down: &Rc<Cell<bool>>,
    next_connection_id: &Rc<Cell<u64>>,
) -> Result<(), Error> {
    let Some(listener) = bind(&config.imap_address, config.imap_port).await?
    else {
        return Ok(());
    };
    info!(
        "IMAP listening on {}:{}",
        config.imap_address, config.imap_port,
    );

    let config = Rc::clone(config);
    let pool = pool.clone();
    let shutting_down = Rc::clone(shutting_down);
    let next_connection_id = Rc::clone(next_connection_id);
    tokio::task::spawn_local(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("IMAP accept failed: {e}");
                    continue;
                },
            };
            let id = next_connection_id.get() + 1;
            next_connection_id.set(id);
            let log_prefix = LogPrefix::new("imap".to_owned(), id);
            info!("{log_prefix} Accepted connection from {peer}");

            let config = Rc::clone(&config);
            let pool = pool.clone();
            let shutting_down = Rc::clone(&shutting_down);
            tokio::task::spawn_local(async move {
                let prefix = log_prefix.clone();
                let result = crate::imap::server::run(
                    Box::new(socket),
                    pool,
                    config,
                    log_prefix,
                    shutting_down,
                )
                .await;
                match result {
                    Ok(()) => info!("{prefix} Connection closed"),
                    Err(e) => info!("{prefix} Connection failed: {e}"),
                }
            });
        }
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn spawn_smtp_listener(
    config: &Rc<SystemConfig>,
    pool: &Pool,
    shutting_down: &Rc<Cell<bool>>,
    next_connection_id: &Rc<Cell<u64>>,
    dialect: Dialect,
    address: ListenAddress,
    port: u16,
) -> Result<(), Error> {
    let Some(listener) = bind(&address, port).await? else {
        return Ok(());
    };
    info!("{dialect:?} listening on {address}:{port}");

    let config = Rc::clone(config);
    let pool = pool.clone();
    let shutting_down = Rc::clone(shutting_down);
    let next_connection_id = Rc::clone(next_connection_id);
    tokio::task::spawn_local(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("{dialect:?} accept failed: {e}");
                    continue;
                },
            };
            let id = next_connection_id.get() + 1;
            next_connection_id.set(id);
            let log_prefix = LogPrefix::new(
                format!("{dialect:?}").to_ascii_lowercase(),
                id,
            );
            info!("{log_prefix} Accepted connection from {peer}");

            let config = Rc::clone(&config);
            let pool = pool.clone();
            let shutting_down = Rc::clone(&shutting_down);
            tokio::task::spawn_local(async move {
                let prefix = log_prefix.clone();
                let result = crate::smtp::inbound::run(
                    Box::new(socket),
                    dialect,
                    pool,
                    config,
                    log_prefix,
                    shutting_down,
                )
                .await;
                match result {
                    Ok(()) => info!("{prefix} Connection closed"),
                    Err(e) => info!("{prefix} Connection failed: {e}"),
                }
            });
        }
    });
    Ok(())
}
