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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data, so a connection
/// can hand its prefix to subordinate objects and later enrich it with the
/// peer's HELO name or authenticated user.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: String,
    id: u64,
    helo: Option<String>,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String, id: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                id,
                helo: None,
                user: None,
            })),
        }
    }

    pub fn deep_clone(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            inner: Arc::new(Mutex::new(Inner::clone(&inner))),
        }
    }

    /// The numeric id, used as the session-log-id part of SMTP transaction
    /// ids.
    pub fn id(&self) -> u64 {
        self.inner.lock().unwrap().id
    }

    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}:{}", inner.protocol, inner.id)?;
        if inner.user.is_some() || inner.helo.is_some() {
            write!(f, "[{}", inner.user.as_deref().unwrap_or("<anon>"))?;
            if let Some(ref helo) = inner.helo {
                write!(f, " helo={}", helo)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}
