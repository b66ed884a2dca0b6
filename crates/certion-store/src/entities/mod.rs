//! Database entities

pub mod access_request;
pub mod firewall_config;
pub mod firewall_rule;
pub mod routing_entry;

pub use access_request::Entity as AccessRequest;
pub use firewall_config::Entity as FirewallConfig;
pub use firewall_rule::Entity as FirewallRule;
pub use routing_entry::Entity as RoutingEntry;

pub mod prelude {
    pub use super::access_request::Entity as AccessRequest;
    pub use super::firewall_config::Entity as FirewallConfig;
    pub use super::firewall_rule::Entity as FirewallRule;
    pub use super::routing_entry::Entity as RoutingEntry;
}
