//! Publisher and subscriber ports

pub mod descriptor;
pub mod publisher;
pub mod subscriber;

pub use descriptor::{
    FixedString, IdString, PortDescriptor, PortQos, PortRole, PublisherState, ServiceDescription,
    SubscriberState, MAX_ID_STRING_LENGTH,
};
pub use publisher::{PublisherData, PublisherPort};
pub use subscriber::{SubscriberData, SubscriberPort};
