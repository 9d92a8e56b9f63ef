pub mod server;

pub use server::run_smtp_server;
