//! Device discovery
//!
//! Turns target descriptors into resolved hosts, by plain name resolution,
//! by browsing multicast DNS on the local adapters, or both.

mod mdns;
mod resolver;

pub use mdns::MdnsProbe;
pub use resolver::{
    is_local_network, Adapter, MulticastProbe, NameLookup, Resolver, ServiceInstance, SystemLookup,
};
