pub mod config;
pub mod error;
pub mod etcd;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod store;
pub mod upstream;
