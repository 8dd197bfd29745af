// Kafka module: the downstream publisher and the circuit breaker guarding it.

pub mod circuit_breaker;
pub mod producer;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker};
pub use producer::{EventPublisher, KafkaPublisher};
