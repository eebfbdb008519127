pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{locks, service, service_with, wait_for_blocked};
