use std::collections::HashMap;
use std::fmt::Display;
use std::net::{ Ipv4Addr, Ipv6Addr };

use crate::zeroconf_error::ZeroConfError;

/// A service protocol plus the domain it is searched or published in,
/// e.g. `_http._tcp.` in `local.`. Used as the key for watches and
/// registrations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceType
{
    type_name: String,
    domain: String
}

impl ServiceType
{
    pub fn new(type_name: &str, domain: &str) -> Result<ServiceType, ZeroConfError>
    {
        if type_name.is_empty() || !type_name.starts_with('_')
        {
            return Err(ZeroConfError::InvalidServiceType);
        }

        if domain.is_empty()
        {
            return Err(ZeroConfError::InvalidServiceType);
        }

        Ok(ServiceType
        {
            type_name: with_trailing_dot(type_name),
            domain: with_trailing_dot(domain)
        })
    }

    pub fn type_name(&self) -> &str
    {
        return &self.type_name;
    }

    pub fn domain(&self) -> &str
    {
        return &self.domain;
    }

    /// The wire-format name without trailing dot, e.g. `_http._tcp.local`.
    pub(crate) fn dns_name(&self) -> String
    {
        format!("{}.{}", self.type_name.trim_end_matches('.'), self.domain.trim_end_matches('.'))
    }

    /// Full instance name on the wire, e.g. `printer._http._tcp.local`.
    pub(crate) fn instance_name(&self, name: &str) -> String
    {
        format!("{}.{}", name, self.dns_name())
    }

    /// Split a wire instance name back into the leading service name, if the
    /// instance belongs to this type.
    pub(crate) fn name_of_instance(&self, instance: &str) -> Option<String>
    {
        let suffix = format!(".{}", self.dns_name());
        if !instance.ends_with(&suffix)
        {
            return None;
        }

        let name = &instance[..instance.len() - suffix.len()];
        if name.is_empty()
        {
            return None;
        }

        Some(name.to_string())
    }
}

impl Display for ServiceType
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{}{}", self.type_name, self.domain)
    }
}

fn with_trailing_dot(value: &str) -> String
{
    if value.ends_with('.')
    {
        return value.to_string();
    }

    format!("{}.", value)
}

/// A discovered or locally published service. Identity is
/// (name, type, domain).
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceRecord
{
    pub name: String,
    pub service_type: ServiceType,
    pub port: u16,
    pub hostname: String,
    pub ipv4_addresses: Vec<Ipv4Addr>,
    pub ipv6_addresses: Vec<Ipv6Addr>,
    pub txt_record: HashMap<String, String>,
    pub ttl: u32
}

impl ServiceRecord
{
    pub fn new(name: &str, service_type: ServiceType) -> ServiceRecord
    {
        ServiceRecord
        {
            name: name.to_string(),
            service_type,
            port: 0,
            hostname: String::new(),
            ipv4_addresses: Vec::new(),
            ipv6_addresses: Vec::new(),
            txt_record: HashMap::new(),
            ttl: 0
        }
    }

    /// A record is resolved once it carries a port and at least one address.
    pub fn is_resolved(&self) -> bool
    {
        return self.port != 0 && (!self.ipv4_addresses.is_empty() || !self.ipv6_addresses.is_empty());
    }
}

/// What happened to a service within a watch session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryAction
{
    Added,
    Resolved,
    Removed,
    NameLost
}

impl Display for DiscoveryAction
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            DiscoveryAction::Added => write!(f, "added"),
            DiscoveryAction::Resolved => write!(f, "resolved"),
            DiscoveryAction::Removed => write!(f, "removed"),
            DiscoveryAction::NameLost => write!(f, "name_lost")
        }
    }
}

/// One identity-state transition, delivered through the event channel.
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryEvent
{
    pub action: DiscoveryAction,
    pub service: ServiceRecord
}

/// Opaque id handed back by `watch`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub(crate) u64);

// TXT metadata travels on the wire as length-prefixed `key=value` strings.
pub(crate) fn txt_map_to_records(txt: &HashMap<String, String>) -> Vec<String>
{
    let mut keys: Vec<&String> = txt.keys().collect();
    keys.sort();

    let mut records = Vec::new();
    for key in keys
    {
        if txt[key].is_empty()
        {
            records.push(key.clone());
        }
        else
        {
            records.push(format!("{}={}", key, txt[key]));
        }
    }

    records
}

pub(crate) fn txt_records_to_map(records: &[String]) -> HashMap<String, String>
{
    let mut map = HashMap::new();
    for record in records
    {
        match record.split_once('=')
        {
            Some((key, value)) =>
            {
                map.insert(key.to_string(), value.to_string());
            },
            None =>
            {
                if !record.is_empty()
                {
                    map.insert(record.clone(), String::new());
                }
            }
        }
    }

    map
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_service_type_normalization()
    {
        let a = ServiceType::new("_http._tcp.", "local.").unwrap();
        let b = ServiceType::new("_http._tcp", "local").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.dns_name(), "_http._tcp.local");
        assert_eq!(a.to_string(), "_http._tcp.local.");
    }

    #[test]
    fn test_service_type_rejects_bad_input()
    {
        assert_eq!(ServiceType::new("http._tcp.", "local.").unwrap_err(), ZeroConfError::InvalidServiceType);
        assert_eq!(ServiceType::new("", "local.").unwrap_err(), ZeroConfError::InvalidServiceType);
        assert_eq!(ServiceType::new("_http._tcp.", "").unwrap_err(), ZeroConfError::InvalidServiceType);
    }

    #[test]
    fn test_instance_name_round_trip()
    {
        let service_type = ServiceType::new("_hap._tcp.", "local.").unwrap();
        let instance = service_type.instance_name("DIRIGERA");

        assert_eq!(instance, "DIRIGERA._hap._tcp.local");
        assert_eq!(service_type.name_of_instance(&instance).unwrap(), "DIRIGERA");
        assert_eq!(service_type.name_of_instance("gw2._airplay._tcp.local"), None);
    }

    #[test]
    fn test_txt_round_trip()
    {
        let mut txt = HashMap::new();
        txt.insert("path".to_string(), "/printer".to_string());
        txt.insert("note".to_string(), String::new());

        let records = txt_map_to_records(&txt);
        assert_eq!(records, vec!["note".to_string(), "path=/printer".to_string()]);

        assert_eq!(txt_records_to_map(&records), txt);
    }

    #[test]
    fn test_is_resolved()
    {
        let service_type = ServiceType::new("_http._tcp.", "local.").unwrap();
        let mut record = ServiceRecord::new("printer", service_type);
        assert!(!record.is_resolved());

        record.port = 80;
        assert!(!record.is_resolved());

        record.ipv4_addresses.push(Ipv4Addr::new(192, 0, 2, 5));
        assert!(record.is_resolved());
    }
}
