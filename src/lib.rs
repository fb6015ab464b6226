//! utilkit
//!
//! A small toolkit of independent utilities, each in its own crate and
//! re-exported here:
//!
//! - [`logger`] - leveled logger with `[LEVEL]` tagged lines and a `tracing` bridge
//! - [`socket`] - TCP, UDP and Unix listeners/dialers forwarding bytes over channels
//! - [`kafka`] - consumer group wrapper with managed connect, claim and shutdown
//! - [`templater`] - text templates rendered with user supplied functions
//!
//! # CLI Usage
//!
//! ```bash
//! # Consume a topic as part of a group and print every message
//! utilkit consume --broker localhost:9092 --topic events --group reporting
//!
//! # Same, with settings from a TOML file
//! utilkit consume-config consumer.toml
//!
//! # Print everything received on a UDP port
//! utilkit listen udp 0.0.0.0:9000
//!
//! # Send stdin lines to a TCP endpoint
//! utilkit send tcp 127.0.0.1:9000
//!
//! # Render a template with JSON data
//! utilkit render greeting.tmpl --data data.json
//! ```

pub use utilkit_kafka as kafka;
pub use utilkit_logger as logger;
pub use utilkit_socket as socket;
pub use utilkit_templater as templater;
