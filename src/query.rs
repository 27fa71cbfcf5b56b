use std::collections::HashMap;
use std::sync::mpsc;
use std::time::{ Duration, Instant };
use log::debug;

use crate::cache::RecordCache;
use crate::dns;
use crate::service::{ DiscoveryAction, DiscoveryEvent, ServiceRecord, ServiceType, WatchId, txt_records_to_map };
use crate::zeroconf_error::ZeroConfError;

// Continuous-query schedule: immediate first query, then doubling up to the
// cap.
pub const QUERY_INTERVAL_MIN: Duration = Duration::from_secs(1);
pub const QUERY_INTERVAL_MAX: Duration = Duration::from_secs(60);

enum KnownState
{
    Added,
    Resolved
}

struct WatchSession
{
    id: WatchId,
    service_type: ServiceType,
    known: HashMap<String, KnownState>,
    next_query_at: Instant,
    query_interval: Duration
}

/// One session per watched service type, multiplexed over the shared cache
/// and transport.
pub struct QueryEngine
{
    sessions: HashMap<ServiceType, WatchSession>,
    next_id: u64
}

impl QueryEngine
{
    pub fn new() -> QueryEngine
    {
        QueryEngine
        {
            sessions: HashMap::new(),
            next_id: 1
        }
    }

    pub fn watch(&mut self, service_type: ServiceType, now: Instant) -> Result<WatchId, ZeroConfError>
    {
        if self.sessions.contains_key(&service_type)
        {
            return Err(ZeroConfError::WatchAlreadyActive);
        }

        let id = WatchId(self.next_id);
        self.next_id += 1;

        debug!("Starting watch {:?} for {}", id, service_type);

        self.sessions.insert(service_type.clone(), WatchSession
        {
            id,
            service_type,
            known: HashMap::new(),
            next_query_at: now,
            query_interval: QUERY_INTERVAL_MIN
        });

        Ok(id)
    }

    /// Drops the session and its known set without emitting further events.
    pub fn unwatch(&mut self, service_type: &ServiceType) -> Result<(), ZeroConfError>
    {
        match self.sessions.remove(service_type)
        {
            Some(session) =>
            {
                debug!("Stopped watch {:?} for {}", session.id, service_type);
                Ok(())
            },
            None =>
            {
                Err(ZeroConfError::WatchNotFound)
            }
        }
    }

    pub fn clear(&mut self)
    {
        self.sessions.clear();
    }

    /// Encoded queries for every session whose schedule is due, with known
    /// answers the cache still holds.
    pub fn due_queries(&mut self, cache: &RecordCache, now: Instant) -> Vec<Vec<u8>>
    {
        let mut packets = Vec::new();

        for session in self.sessions.values_mut()
        {
            if now < session.next_query_at
            {
                continue;
            }

            let service_name = session.service_type.dns_name();
            let known_answers = cache.suppressed_answers(&service_name, now);

            match dns::new_query(&service_name, &known_answers)
            {
                Ok(packet) =>
                {
                    debug!("Sending query for service: {} ({} known answers)", service_name, known_answers.len());
                    packets.push(packet);
                },
                Err(err) =>
                {
                    debug!("Failed to build query for {}: {}", service_name, err);
                }
            }

            session.next_query_at = now + session.query_interval;
            session.query_interval = std::cmp::min(session.query_interval * 2, QUERY_INTERVAL_MAX);
        }

        packets
    }

    /// Re-evaluate the given instances against every matching session and
    /// emit the per-identity transitions: added -> resolved -> removed.
    pub fn sync_instances(
        &mut self,
        instances: &[String],
        cache: &RecordCache,
        events: &mpsc::Sender<DiscoveryEvent>,
        now: Instant
    )
    {
        for instance in instances
        {
            for session in self.sessions.values_mut()
            {
                let name = match session.service_type.name_of_instance(instance)
                {
                    Some(name) => name,
                    None => continue
                };

                match cache.resolve(instance, now)
                {
                    None =>
                    {
                        if session.known.remove(instance).is_some()
                        {
                            let record = ServiceRecord::new(&name, session.service_type.clone());
                            let _ = events.send(DiscoveryEvent
                            {
                                action: DiscoveryAction::Removed,
                                service: record
                            });
                        }
                    },
                    Some(merged) =>
                    {
                        let mut record = ServiceRecord::new(&name, session.service_type.clone());
                        record.port = merged.port.unwrap_or(0);
                        record.hostname = merged.hostname.clone().unwrap_or_default();
                        record.ipv4_addresses = merged.v4_addresses.clone();
                        record.ipv6_addresses = merged.v6_addresses.clone();
                        record.txt_record = txt_records_to_map(&merged.txt_records);
                        record.ttl = merged.ttl;

                        match session.known.get(instance)
                        {
                            None =>
                            {
                                let _ = events.send(DiscoveryEvent
                                {
                                    action: DiscoveryAction::Added,
                                    service: record.clone()
                                });

                                if merged.is_resolved()
                                {
                                    session.known.insert(instance.clone(), KnownState::Resolved);
                                    let _ = events.send(DiscoveryEvent
                                    {
                                        action: DiscoveryAction::Resolved,
                                        service: record
                                    });
                                }
                                else
                                {
                                    session.known.insert(instance.clone(), KnownState::Added);
                                }
                            },
                            Some(KnownState::Added) =>
                            {
                                if merged.is_resolved()
                                {
                                    session.known.insert(instance.clone(), KnownState::Resolved);
                                    let _ = events.send(DiscoveryEvent
                                    {
                                        action: DiscoveryAction::Resolved,
                                        service: record
                                    });
                                }
                            },
                            Some(KnownState::Resolved) =>
                            {
                                // TTL refresh, nothing new to report.
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use std::net::Ipv4Addr;
    use crate::dns::{ Answer, PtrAnswer, SrvAnswer, AAnswer };

    fn service_type() -> ServiceType
    {
        ServiceType::new("_http._tcp.", "local.").unwrap()
    }

    fn announce(cache: &mut RecordCache, now: Instant) -> Vec<String>
    {
        let mut touched = Vec::new();
        let answers = vec![
            Answer::Ptr(PtrAnswer
            {
                label: "_http._tcp.local".to_string(),
                service: "printer._http._tcp.local".to_string(),
                ttl: 4500
            }),
            Answer::Srv(SrvAnswer
            {
                label: "printer._http._tcp.local".to_string(),
                target: "printhost.local".to_string(),
                port: 80,
                ttl: 120,
                cache_flush: true
            }),
            Answer::A(AAnswer
            {
                label: "printhost.local".to_string(),
                address: Ipv4Addr::new(192, 0, 2, 5),
                ttl: 120,
                cache_flush: true
            })
        ];

        for answer in answers.iter()
        {
            touched.extend(cache.apply(answer, now));
        }
        touched.sort();
        touched.dedup();
        touched
    }

    #[test]
    fn test_watch_rejects_duplicate()
    {
        let now = Instant::now();
        let mut engine = QueryEngine::new();

        engine.watch(service_type(), now).unwrap();
        assert_eq!(engine.watch(service_type(), now).unwrap_err(), ZeroConfError::WatchAlreadyActive);
    }

    #[test]
    fn test_unwatch_unknown_type()
    {
        let mut engine = QueryEngine::new();
        assert_eq!(engine.unwatch(&service_type()).unwrap_err(), ZeroConfError::WatchNotFound);
    }

    #[test]
    fn test_added_then_resolved_single_pair()
    {
        let now = Instant::now();
        let mut engine = QueryEngine::new();
        let mut cache = RecordCache::new();
        let (tx, rx) = mpsc::channel();

        engine.watch(service_type(), now).unwrap();

        let touched = announce(&mut cache, now);
        engine.sync_instances(&touched, &cache, &tx, now);

        let added = rx.try_recv().unwrap();
        assert_eq!(added.action, DiscoveryAction::Added);
        assert_eq!(added.service.name, "printer");

        let resolved = rx.try_recv().unwrap();
        assert_eq!(resolved.action, DiscoveryAction::Resolved);
        assert_eq!(resolved.service.port, 80);
        assert_eq!(resolved.service.ipv4_addresses, vec![Ipv4Addr::new(192, 0, 2, 5)]);
        assert_eq!(resolved.service.hostname, "printhost.local");

        // A repeated announcement refreshes TTLs without new events.
        let touched = announce(&mut cache, now + Duration::from_secs(1));
        engine.sync_instances(&touched, &cache, &tx, now + Duration::from_secs(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_partial_discovery_adds_before_resolve()
    {
        let now = Instant::now();
        let mut engine = QueryEngine::new();
        let mut cache = RecordCache::new();
        let (tx, rx) = mpsc::channel();

        engine.watch(service_type(), now).unwrap();

        // PTR alone identifies the instance but cannot resolve it.
        let touched = cache.apply(&Answer::Ptr(PtrAnswer
        {
            label: "_http._tcp.local".to_string(),
            service: "printer._http._tcp.local".to_string(),
            ttl: 4500
        }), now);
        engine.sync_instances(&touched, &cache, &tx, now);

        let added = rx.try_recv().unwrap();
        assert_eq!(added.action, DiscoveryAction::Added);
        assert_eq!(added.service.port, 0);
        assert!(rx.try_recv().is_err());

        // SRV and address complete the record.
        let mut touched = cache.apply(&Answer::Srv(SrvAnswer
        {
            label: "printer._http._tcp.local".to_string(),
            target: "printhost.local".to_string(),
            port: 80,
            ttl: 120,
            cache_flush: true
        }), now);
        touched.extend(cache.apply(&Answer::A(AAnswer
        {
            label: "printhost.local".to_string(),
            address: Ipv4Addr::new(192, 0, 2, 5),
            ttl: 120,
            cache_flush: true
        }), now));
        engine.sync_instances(&touched, &cache, &tx, now);

        let resolved = rx.try_recv().unwrap();
        assert_eq!(resolved.action, DiscoveryAction::Resolved);
        assert!(resolved.service.is_resolved());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_goodbye_emits_removed()
    {
        let now = Instant::now();
        let mut engine = QueryEngine::new();
        let mut cache = RecordCache::new();
        let (tx, rx) = mpsc::channel();

        engine.watch(service_type(), now).unwrap();

        let touched = announce(&mut cache, now);
        engine.sync_instances(&touched, &cache, &tx, now);
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        let touched = cache.apply(&Answer::Ptr(PtrAnswer
        {
            label: "_http._tcp.local".to_string(),
            service: "printer._http._tcp.local".to_string(),
            ttl: 0
        }), now);
        engine.sync_instances(&touched, &cache, &tx, now);

        let removed = rx.try_recv().unwrap();
        assert_eq!(removed.action, DiscoveryAction::Removed);
        assert_eq!(removed.service.name, "printer");

        // A second goodbye for a forgotten identity is silent.
        let touched = cache.apply(&Answer::Ptr(PtrAnswer
        {
            label: "_http._tcp.local".to_string(),
            service: "printer._http._tcp.local".to_string(),
            ttl: 0
        }), now);
        engine.sync_instances(&touched, &cache, &tx, now);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unwatch_discards_known_set()
    {
        let now = Instant::now();
        let mut engine = QueryEngine::new();
        let mut cache = RecordCache::new();
        let (tx, rx) = mpsc::channel();

        engine.watch(service_type(), now).unwrap();
        let touched = announce(&mut cache, now);
        engine.sync_instances(&touched, &cache, &tx, now);
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        engine.unwatch(&service_type()).unwrap();

        // Goodbye after unwatch reaches nobody.
        let touched = cache.apply(&Answer::Ptr(PtrAnswer
        {
            label: "_http._tcp.local".to_string(),
            service: "printer._http._tcp.local".to_string(),
            ttl: 0
        }), now);
        engine.sync_instances(&touched, &cache, &tx, now);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_query_backoff_doubles_up_to_cap()
    {
        let mut now = Instant::now();
        let mut engine = QueryEngine::new();
        let cache = RecordCache::new();

        engine.watch(service_type(), now).unwrap();

        // Immediate first query.
        assert_eq!(engine.due_queries(&cache, now).len(), 1);

        // Not due again before the first interval elapses.
        assert_eq!(engine.due_queries(&cache, now).len(), 0);

        let mut interval = QUERY_INTERVAL_MIN;
        for _ in 0..8
        {
            now += interval;
            assert_eq!(engine.due_queries(&cache, now).len(), 1);
            interval = std::cmp::min(interval * 2, QUERY_INTERVAL_MAX);
        }

        assert_eq!(interval, QUERY_INTERVAL_MAX);
    }

    #[test]
    fn test_query_carries_known_answers()
    {
        let now = Instant::now();
        let mut engine = QueryEngine::new();
        let mut cache = RecordCache::new();

        engine.watch(service_type(), now).unwrap();
        announce(&mut cache, now);

        let packets = engine.due_queries(&cache, now);
        assert_eq!(packets.len(), 1);

        let message = crate::dns::DnsMessage::from(&packets[0]).unwrap();
        assert_eq!(message.questions.len(), 1);
        assert_eq!(message.answers.len(), 1);
        match &message.answers[0]
        {
            Answer::Ptr(ptr) =>
            {
                assert_eq!(ptr.service, "printer._http._tcp.local");
            },
            other => panic!("expected PTR known answer, got {:?}", other)
        }
    }
}
