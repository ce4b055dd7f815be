//! Pieces shared by the vendor drivers.
//!
//! - [`defaults`]: repository fallbacks for per-call options
//! - [`guard`]: timeout and cancellation around a worker body
//! - [`tls`]: `ssl_mode` handling for both vendors

pub mod defaults;
pub mod guard;
pub mod tls;

pub use defaults::WorkerDefaults;
pub use guard::run_guarded;
pub use tls::SslMode;
