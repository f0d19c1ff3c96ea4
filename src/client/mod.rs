//! Client layer: connections, info and admin protocols, and the public API

pub mod admin;
pub mod buffer_pool;
#[allow(clippy::module_inception)]
pub mod client;
pub mod connection;
pub mod control_plane;
pub mod tasks;

pub use admin::{Privilege, PrivilegeCode, Role, User};
pub use client::{Client, UdfLanguage, UdfMeta};
pub use connection::Connection;
pub use control_plane::ControlPlane;
pub use tasks::{IndexTask, Task, UdfTask};
