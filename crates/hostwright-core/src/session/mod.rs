// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote session backends.
//!
//! The engine only sees the [`SessionConnector`] and [`RemoteSession`]
//! traits. The worker crate provides the SSH implementation; [`mock`]
//! provides a scripted one for tests and dry runs.

pub mod mock;
mod traits;

pub use mock::{ScriptedConnector, ScriptedSession};
pub use traits::*;
