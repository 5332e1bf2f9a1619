pub mod builder;
pub mod definition;
pub mod error;
pub mod event;
pub mod identity;
pub mod interface;
pub mod netron;
pub mod options;
pub mod packet;
pub mod peer;
pub mod reflection;
pub mod registry;
pub mod stub;
pub mod task;
pub mod transport;
pub mod value;

pub use builder::NetronBuilder;
pub use definition::Definition;
pub use definition::Definitions;
pub use definition::Member;
pub use definition::Reference;
pub use error::Error;
pub use error::ErrorKind;
pub use error::Result;
pub use identity::Identity;
pub use identity::PeerInfo;
pub use interface::Interface;
pub use netron::Netron;
pub use options::Options;
pub use peer::OwnPeer;
pub use peer::Peer;
pub use peer::RemotePeer;
pub use reflection::Context;
pub use reflection::MethodMeta;
pub use reflection::PropertyMeta;
pub use reflection::Reflection;
pub use stub::Stub;
pub use task::Task;
pub use task::TaskRequest;
pub use task::TaskResult;
pub use value::Value;
