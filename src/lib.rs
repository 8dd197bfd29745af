//! Reliable event bridge: consumes events from RabbitMQ, publishes them to
//! Kafka keyed by event id, and records completion in a Redis ledger so that
//! upstream redeliveries have effectively-once downstream effect.

pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod idempotency;
pub mod kafka;
pub mod metrics;
pub mod processor;
pub mod rabbitmq;
pub mod retry;

pub use config::Config;
pub use event::Event;
pub use processor::EventProcessor;
pub use rabbitmq::RabbitMqConsumer;
