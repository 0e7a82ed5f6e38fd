//! Integration tests, run with `cargo test --test unit`

mod support;

mod test_config;
mod test_deploy;
mod test_fsm;
mod test_guard;
mod test_supervisor;
