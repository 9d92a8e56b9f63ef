pub mod store;
pub mod redis;

#[cfg(test)]
pub mod memory;

pub use store::{ Email, EmailStore };
pub use redis::RedisStore;
