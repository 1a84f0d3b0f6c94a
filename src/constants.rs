//! # Wire and Broker Constants
//!
//! Values shared by the publisher, the delay scheduler and the consumption
//! engine so both ends of the wire agree on them.

/// Content type of every serialized signature body
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content-encoding tag of LZ4 compressed bodies
pub const ENCODING_LZ4: &str = "lz4";

/// Bodies of at least this many bytes are compressed before publishing
pub const MIN_COMPRESSIBLE_LEN: usize = 101;

/// Prefix of the per-duration delay queues
pub const DELAY_QUEUE_PREFIX: &str = "delay";

/// Default lifetime of task state and group meta records
pub const DEFAULT_RESULTS_EXPIRE_IN_SECS: u64 = 3600;

/// Queue declaration arguments understood by the broker
pub mod queue_args {
    /// Exchange where expired messages are re-published
    pub const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
    /// Routing key used when re-publishing expired messages
    pub const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
    /// Per-message time to live in milliseconds
    pub const MESSAGE_TTL: &str = "x-message-ttl";
    /// Idle time in milliseconds after which the queue deletes itself
    pub const EXPIRES: &str = "x-expires";
}

/// Exchange types with routing semantics the engine relies on
pub mod exchange_types {
    pub const DIRECT: &str = "direct";
    pub const FANOUT: &str = "fanout";
    pub const TOPIC: &str = "topic";
}
