// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The simulation request server.
//!
//! Two scheduling domains meet here. Worker threads accept framed requests
//! from the runtime and block; the single-threaded simulator executes the
//! actual bus traffic. The only things shared between them are:
//!
//! - the operation FIFO ([`bridge::OpQueue`]): plain tagged records, one
//!   per request, each paired with a one-shot [`bridge::Completion`].
//!   Coroutines are constructed on the simulator thread from the records,
//!   never shipped across;
//! - the interrupt registry ([`interrupt::InterruptMap`]), owned and
//!   locked by the server domain;
//! - the status cache, a write-once completion the simulator publishes.
//!
//! The simulator side never blocks on a server-domain lock; workers block
//! only on completions the simulator sets.

pub mod bridge;
pub mod interrupt;
pub mod server;

pub use bridge::{Completion, OpQueue, SimOp, StatusCache};
pub use interrupt::{InterruptMap, SimInterrupt};
pub use server::{ServerConfig, ServerHandle};
