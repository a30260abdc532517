//! MQTT-SN 1.2 gateway and client.
//!
//! Sensor-class devices speak MQTT-SN over UDP; the gateway gives each of
//! them its own MQTT 3.1.1 connection to a standard broker and translates
//! between the two protocols:
//!
//! - **Topics**: normal ids registered per client, predefined ids from the
//!   gateway configuration, and two-character short names
//! - **QoS**: -1 (session-less), 0, 1 and 2 in both directions
//! - **Sleep**: messages for sleeping clients are buffered and flushed on
//!   wake-up
//!
//! ## Components
//!
//! - [`Gateway`]: UDP front end, one [`Session`] per client address
//! - [`Client`]: MQTT-SN client for any [`Transport`]
//!
//! ## Example
//!
//! ```no_run
//! use giztoy_mqttsn::{Client, ClientConfig, Gateway, GatewayConfig, QoS, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() -> giztoy_mqttsn::Result<()> {
//!     // Start gateway
//!     let gateway = Gateway::new(GatewayConfig::new("127.0.0.1:1884", "127.0.0.1:1883"));
//!     tokio::spawn(async move { gateway.serve().await });
//!
//!     // Connect client
//!     let transport = UdpTransport::connect("127.0.0.1:1884").await?;
//!     let client = Client::connect(transport, ClientConfig::new("sensor-1")).await?;
//!
//!     // Subscribe and publish
//!     client.subscribe("sensors/+", QoS::AtLeastOnce).await?;
//!     client.publish("sensors/temp", "21.5", QoS::AtLeastOnce, false).await?;
//!
//!     // Receive message
//!     let msg = client.recv().await?;
//!     println!("Received: {:?}", msg);
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
mod error;
pub mod gateway;
pub mod mqtt;
pub mod packet;
pub mod store;
pub mod topics;
pub mod transaction;
pub mod transport;
mod types;

pub use client::{Client, ClientConfig, LastWill};
pub use codec::{Codec, MqttSnCodec};
pub use error::{Error, Result, TransactionError};
pub use gateway::{Gateway, GatewayConfig, Session};
pub use packet::{Packet, TopicFilter, TopicRef};
pub use topics::PredefinedTopics;
pub use transport::{PipeTransport, Transport, UdpTransport, pipe};
pub use types::{Message, PROTOCOL_ID, QoS, ReturnCode, SessionState, TopicIdType};

#[cfg(test)]
mod tests;
