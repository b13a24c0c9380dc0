//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod error;
pub mod node;
pub mod port;
pub mod subnet;
pub mod switch;

pub use error::Error;
pub use node::Node;
pub use port::{PhysPort, Port, PortFlags};
pub use subnet::{NodeIndex, PortIndex, Subnet, SwitchIndex};
pub use switch::Switch;
