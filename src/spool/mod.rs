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

//! Outbound mail: the queue scanner and the per-message delivery agents.

pub mod agent;
pub mod manager;

pub use agent::DeliveryAgent;
pub use manager::SpoolManager;

/// The retry/expiry horizon, in seconds, shared by the queue scan and the
/// startup expiry refresh.
pub const SPOOL_INTERVAL: u32 = 900;
