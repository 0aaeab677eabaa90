// GB28181 SIP 信令

pub mod correlator;
pub mod device;
pub mod factory;
pub mod invite;
pub mod message;

pub use correlator::{extract, DialogIds};
pub use device::{Device, DeviceManager, DeviceRegistry, MediaDetail};
pub use factory::RequestFactory;
pub use invite::SdpSession;
pub use message::{header_param, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
