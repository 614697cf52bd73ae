//! Global logger setup for the `bcachefs-acct` binary.
//!
//! `accounting-core` only ever calls through the `log` facade and never
//! installs a logger itself — that would be rude for a library crate
//! that might get linked into something else's process. The binary owns
//! the one-time `env_logger` init, same as bcachefs-tools' own CLI:
//! level comes from `RUST_LOG`, defaulting to `info` so a plain run
//! shows reservation/gc/resize milestones without drowning in per-bucket
//! `trace!` noise from the marking engine's CAS loop.

pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
