// GB28181 SIP 协议栈

pub mod builder;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use builder::{LocalEndpoint, OutboundConfig};
pub use message::{Headers, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{SdpAnswer, SdpOffer};
pub use transaction::{ClientTransaction, ResponseSink, SipClient, TransactionTable};
pub use transport::{RequestHandler, SipTransport};
