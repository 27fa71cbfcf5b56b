use std::collections::HashMap;
use std::net::{ Ipv4Addr, Ipv6Addr };
use std::time::{ Duration, Instant };
use log::debug;

use crate::dns::{ Answer, PtrAnswer };

struct Fragment<T>
{
    data: T,
    original_ttl: u32,
    expires_at: Instant
}

impl<T> Fragment<T>
{
    fn new(data: T, ttl: u32, now: Instant) -> Fragment<T>
    {
        Fragment
        {
            data,
            original_ttl: ttl,
            expires_at: now + Duration::from_secs(ttl as u64)
        }
    }

    fn refresh(&mut self, ttl: u32, now: Instant)
    {
        self.original_ttl = ttl;
        self.expires_at = now + Duration::from_secs(ttl as u64);
    }

    fn expired(&self, now: Instant) -> bool
    {
        return now >= self.expires_at;
    }

    fn remaining_secs(&self, now: Instant) -> u32
    {
        if now >= self.expires_at
        {
            return 0;
        }

        (self.expires_at - now).as_secs() as u32
    }
}

struct SrvData
{
    target: String,
    port: u16
}

struct InstanceEntry
{
    ptr: Option<Fragment<()>>,
    srv: Option<Fragment<SrvData>>,
    txt: Option<Fragment<Vec<String>>>
}

impl InstanceEntry
{
    fn new() -> InstanceEntry
    {
        InstanceEntry
        {
            ptr: None,
            srv: None,
            txt: None
        }
    }

    fn present(&self) -> bool
    {
        return self.ptr.is_some() || self.srv.is_some();
    }
}

struct HostEntry
{
    v4: HashMap<Ipv4Addr, Fragment<()>>,
    v6: HashMap<Ipv6Addr, Fragment<()>>
}

impl HostEntry
{
    fn new() -> HostEntry
    {
        HostEntry
        {
            v4: HashMap::new(),
            v6: HashMap::new()
        }
    }
}

/// Merged view of one instance, built from whatever fragments the cache
/// currently holds.
pub struct CachedInstance
{
    pub port: Option<u16>,
    pub hostname: Option<String>,
    pub v4_addresses: Vec<Ipv4Addr>,
    pub v6_addresses: Vec<Ipv6Addr>,
    pub txt_records: Vec<String>,
    pub ttl: u32
}

impl CachedInstance
{
    pub fn is_resolved(&self) -> bool
    {
        return self.port.is_some() && (!self.v4_addresses.is_empty() || !self.v6_addresses.is_empty());
    }
}

/// Known resource records keyed by instance and hostname, each fragment with
/// its own expiry.
pub struct RecordCache
{
    instances: HashMap<String, InstanceEntry>,
    hosts: HashMap<String, HostEntry>
}

impl RecordCache
{
    pub fn new() -> RecordCache
    {
        RecordCache
        {
            instances: HashMap::new(),
            hosts: HashMap::new()
        }
    }

    /// Apply one received record. Returns the instance names whose merged
    /// state may have changed.
    pub fn apply(&mut self, answer: &Answer, now: Instant) -> Vec<String>
    {
        match answer
        {
            Answer::Ptr(ptr) =>
            {
                if ptr.ttl == 0
                {
                    // Goodbye for the whole instance.
                    if self.instances.remove(&ptr.service).is_some()
                    {
                        debug!("Goodbye for instance {}", ptr.service);
                        return vec![ptr.service.clone()];
                    }

                    return Vec::new();
                }

                let entry = self.instances.entry(ptr.service.clone()).or_insert_with(InstanceEntry::new);
                match entry.ptr.as_mut()
                {
                    Some(fragment) => fragment.refresh(ptr.ttl, now),
                    None => entry.ptr = Some(Fragment::new((), ptr.ttl, now))
                }

                vec![ptr.service.clone()]
            },
            Answer::Srv(srv) =>
            {
                if srv.ttl == 0
                {
                    let mut removed = false;
                    if let Some(entry) = self.instances.get_mut(&srv.label)
                    {
                        entry.srv = None;
                        if !entry.present()
                        {
                            self.instances.remove(&srv.label);
                        }
                        removed = true;
                    }

                    if removed
                    {
                        return vec![srv.label.clone()];
                    }

                    return Vec::new();
                }

                let data = SrvData
                {
                    target: srv.target.clone(),
                    port: srv.port
                };

                let entry = self.instances.entry(srv.label.clone()).or_insert_with(InstanceEntry::new);
                entry.srv = Some(Fragment::new(data, srv.ttl, now));

                vec![srv.label.clone()]
            },
            Answer::Txt(txt) =>
            {
                if txt.ttl == 0
                {
                    if let Some(entry) = self.instances.get_mut(&txt.label)
                    {
                        entry.txt = None;
                        return vec![txt.label.clone()];
                    }

                    return Vec::new();
                }

                let entry = self.instances.entry(txt.label.clone()).or_insert_with(InstanceEntry::new);
                entry.txt = Some(Fragment::new(txt.records.clone(), txt.ttl, now));

                vec![txt.label.clone()]
            },
            Answer::A(a) =>
            {
                if a.ttl == 0
                {
                    if let Some(host) = self.hosts.get_mut(&a.label)
                    {
                        host.v4.remove(&a.address);
                    }
                }
                else
                {
                    let host = self.hosts.entry(a.label.clone()).or_insert_with(HostEntry::new);
                    match host.v4.get_mut(&a.address)
                    {
                        Some(fragment) => fragment.refresh(a.ttl, now),
                        None =>
                        {
                            host.v4.insert(a.address, Fragment::new((), a.ttl, now));
                        }
                    }
                }

                self.instances_with_target(&a.label)
            },
            Answer::Aaaa(aaaa) =>
            {
                if aaaa.ttl == 0
                {
                    if let Some(host) = self.hosts.get_mut(&aaaa.label)
                    {
                        host.v6.remove(&aaaa.address);
                    }
                }
                else
                {
                    let host = self.hosts.entry(aaaa.label.clone()).or_insert_with(HostEntry::new);
                    match host.v6.get_mut(&aaaa.address)
                    {
                        Some(fragment) => fragment.refresh(aaaa.ttl, now),
                        None =>
                        {
                            host.v6.insert(aaaa.address, Fragment::new((), aaaa.ttl, now));
                        }
                    }
                }

                self.instances_with_target(&aaaa.label)
            }
        }
    }

    fn instances_with_target(&self, hostname: &str) -> Vec<String>
    {
        self.instances
            .iter()
            .filter(|(_, entry)| match &entry.srv
            {
                Some(fragment) => fragment.data.target == hostname,
                None => false
            })
            .map(|(instance, _)| instance.clone())
            .collect()
    }

    /// Instance names currently known for a service type's wire name.
    pub fn instances_of(&self, service_dns_name: &str) -> Vec<String>
    {
        let suffix = format!(".{}", service_dns_name);

        self.instances
            .keys()
            .filter(|instance| instance.ends_with(&suffix))
            .cloned()
            .collect()
    }

    /// Merge the fragments of one instance. Returns None once nothing keeps
    /// the identity alive.
    pub fn resolve(&self, instance: &str, now: Instant) -> Option<CachedInstance>
    {
        let entry = self.instances.get(instance)?;
        if !entry.present()
        {
            return None;
        }

        let mut merged = CachedInstance
        {
            port: None,
            hostname: None,
            v4_addresses: Vec::new(),
            v6_addresses: Vec::new(),
            txt_records: Vec::new(),
            ttl: 0
        };

        if let Some(ptr) = &entry.ptr
        {
            merged.ttl = ptr.remaining_secs(now);
        }

        if let Some(srv) = &entry.srv
        {
            merged.port = Some(srv.data.port);
            merged.hostname = Some(srv.data.target.clone());
            if merged.ttl == 0
            {
                merged.ttl = srv.remaining_secs(now);
            }

            if let Some(host) = self.hosts.get(&srv.data.target)
            {
                let mut v4: Vec<Ipv4Addr> = host.v4.keys().copied().collect();
                let mut v6: Vec<Ipv6Addr> = host.v6.keys().copied().collect();
                v4.sort();
                v6.sort();
                merged.v4_addresses = v4;
                merged.v6_addresses = v6;
            }
        }

        if let Some(txt) = &entry.txt
        {
            merged.txt_records = txt.data.clone();
        }

        Some(merged)
    }

    /// Drop expired fragments. Returns the instance names that ceased to be
    /// known; the caller emits `removed` for those.
    pub fn expire_older_than(&mut self, now: Instant) -> Vec<String>
    {
        let mut removed = Vec::new();

        for (instance, entry) in self.instances.iter_mut()
        {
            if let Some(fragment) = &entry.ptr
            {
                if fragment.expired(now)
                {
                    entry.ptr = None;
                }
            }

            if let Some(fragment) = &entry.srv
            {
                if fragment.expired(now)
                {
                    entry.srv = None;
                }
            }

            if let Some(fragment) = &entry.txt
            {
                if fragment.expired(now)
                {
                    entry.txt = None;
                }
            }

            if !entry.present()
            {
                removed.push(instance.clone());
            }
        }

        for instance in removed.iter()
        {
            self.instances.remove(instance);
        }

        for host in self.hosts.values_mut()
        {
            host.v4.retain(|_, fragment| !fragment.expired(now));
            host.v6.retain(|_, fragment| !fragment.expired(now));
        }

        self.hosts.retain(|_, host| !host.v4.is_empty() || !host.v6.is_empty());

        removed
    }

    /// Known-answer suppression: PTR records still above half their original
    /// TTL are sent along with queries so peers do not repeat them.
    pub fn suppressed_answers(&self, service_dns_name: &str, now: Instant) -> Vec<Answer>
    {
        let suffix = format!(".{}", service_dns_name);
        let mut answers = Vec::new();

        for (instance, entry) in self.instances.iter()
        {
            if !instance.ends_with(&suffix)
            {
                continue;
            }

            if let Some(fragment) = &entry.ptr
            {
                let remaining = fragment.remaining_secs(now);
                if remaining > fragment.original_ttl / 2
                {
                    answers.push(Answer::Ptr(PtrAnswer
                    {
                        label: service_dns_name.to_string(),
                        service: instance.clone(),
                        ttl: remaining
                    }));
                }
            }
        }

        answers
    }

    #[cfg(test)]
    fn len(&self) -> usize
    {
        return self.instances.len();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dns::{ SrvAnswer, AAnswer };

    fn ptr(service: &str, ttl: u32) -> Answer
    {
        Answer::Ptr(PtrAnswer
        {
            label: "_http._tcp.local".to_string(),
            service: service.to_string(),
            ttl
        })
    }

    fn srv(label: &str, target: &str, port: u16, ttl: u32) -> Answer
    {
        Answer::Srv(SrvAnswer
        {
            label: label.to_string(),
            target: target.to_string(),
            port,
            ttl,
            cache_flush: false
        })
    }

    fn a(label: &str, address: Ipv4Addr, ttl: u32) -> Answer
    {
        Answer::A(AAnswer
        {
            label: label.to_string(),
            address,
            ttl,
            cache_flush: false
        })
    }

    #[test]
    fn test_fragments_merge_into_resolved_instance()
    {
        let now = Instant::now();
        let mut cache = RecordCache::new();

        cache.apply(&ptr("printer._http._tcp.local", 4500), now);

        let merged = cache.resolve("printer._http._tcp.local", now).unwrap();
        assert!(!merged.is_resolved());

        cache.apply(&srv("printer._http._tcp.local", "printhost.local", 80, 120), now);
        cache.apply(&a("printhost.local", Ipv4Addr::new(192, 0, 2, 5), 120), now);

        let merged = cache.resolve("printer._http._tcp.local", now).unwrap();
        assert!(merged.is_resolved());
        assert_eq!(merged.port, Some(80));
        assert_eq!(merged.hostname.as_deref(), Some("printhost.local"));
        assert_eq!(merged.v4_addresses, vec![Ipv4Addr::new(192, 0, 2, 5)]);
    }

    #[test]
    fn test_address_update_touches_dependent_instances()
    {
        let now = Instant::now();
        let mut cache = RecordCache::new();

        cache.apply(&srv("printer._http._tcp.local", "printhost.local", 80, 120), now);
        let touched = cache.apply(&a("printhost.local", Ipv4Addr::new(192, 0, 2, 5), 120), now);

        assert_eq!(touched, vec!["printer._http._tcp.local".to_string()]);
    }

    #[test]
    fn test_goodbye_removes_instance()
    {
        let now = Instant::now();
        let mut cache = RecordCache::new();

        cache.apply(&ptr("printer._http._tcp.local", 4500), now);
        assert_eq!(cache.len(), 1);

        let touched = cache.apply(&ptr("printer._http._tcp.local", 0), now);
        assert_eq!(touched, vec!["printer._http._tcp.local".to_string()]);
        assert_eq!(cache.len(), 0);
        assert!(cache.resolve("printer._http._tcp.local", now).is_none());
    }

    #[test]
    fn test_expiry_returns_removed_instances()
    {
        let now = Instant::now();
        let mut cache = RecordCache::new();

        cache.apply(&ptr("printer._http._tcp.local", 2), now);

        assert_eq!(cache.expire_older_than(now + Duration::from_secs(1)), Vec::<String>::new());

        let removed = cache.expire_older_than(now + Duration::from_secs(2));
        assert_eq!(removed, vec!["printer._http._tcp.local".to_string()]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_ttl_refresh_extends_expiry()
    {
        let now = Instant::now();
        let mut cache = RecordCache::new();

        cache.apply(&ptr("printer._http._tcp.local", 2), now);
        cache.apply(&ptr("printer._http._tcp.local", 120), now + Duration::from_secs(1));

        let removed = cache.expire_older_than(now + Duration::from_secs(3));
        assert!(removed.is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_suppressed_answers_above_half_ttl()
    {
        let now = Instant::now();
        let mut cache = RecordCache::new();

        cache.apply(&ptr("fresh._http._tcp.local", 100), now);
        cache.apply(&ptr("stale._http._tcp.local", 100), now);

        // 60 seconds in, `fresh` was refreshed but `stale` was not: only the
        // refreshed record is still worth suppressing.
        let later = now + Duration::from_secs(60);
        cache.apply(&ptr("fresh._http._tcp.local", 100), later);

        let answers = cache.suppressed_answers("_http._tcp.local", later);
        assert_eq!(answers.len(), 1);
        match &answers[0]
        {
            Answer::Ptr(answer) =>
            {
                assert_eq!(answer.service, "fresh._http._tcp.local");
                assert!(answer.ttl > 50);
            },
            other => panic!("expected PTR answer, got {:?}", other)
        }
    }

    #[test]
    fn test_instances_of_matches_suffix_only()
    {
        let now = Instant::now();
        let mut cache = RecordCache::new();

        cache.apply(&ptr("printer._http._tcp.local", 4500), now);
        cache.apply(&srv("gw._hap._tcp.local", "gw.local", 8000, 120), now);

        let instances = cache.instances_of("_http._tcp.local");
        assert_eq!(instances, vec!["printer._http._tcp.local".to_string()]);
    }
}
