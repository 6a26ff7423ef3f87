// Library for tests to access modules

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod netlink;
pub mod netns;
pub mod runtime;
pub mod traffic;
