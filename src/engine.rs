use std::collections::HashMap;
use std::net::{ SocketAddr, UdpSocket };
use std::sync::{ Arc, Mutex, atomic::{ AtomicBool, Ordering } };
use std::sync::mpsc;
use std::thread;
use std::time::{ Duration, Instant };
use log::{ debug, info, warn };

use crate::cache::RecordCache;
use crate::debug::Hex;
use crate::dns;
use crate::dns::DnsMessage;
use crate::query::QueryEngine;
use crate::responder::{ self, Responder };
use crate::service::{ DiscoveryAction, DiscoveryEvent, ServiceType, WatchId };
use crate::socket::MulticastTransport;
use crate::zeroconf_error::ZeroConfError;

const SCHEDULER_TICK: Duration = Duration::from_millis(250);

/// A packet the engine wants on the wire, multicast unless a peer address is
/// given.
pub struct Outgoing
{
    pub buffer: Vec<u8>,
    pub unicast: bool
}

impl Outgoing
{
    fn multicast(buffer: Vec<u8>) -> Outgoing
    {
        Outgoing
        {
            buffer,
            unicast: false
        }
    }
}

/// The single serialization point: every cache mutation and session or
/// registration transition happens while holding this state, whether driven
/// by a receive loop or an API call.
pub struct Engine
{
    cache: RecordCache,
    queries: QueryEngine,
    responder: Responder,
    events: mpsc::Sender<DiscoveryEvent>,
    closed: bool
}

impl Engine
{
    pub fn new(responder: Responder, events: mpsc::Sender<DiscoveryEvent>) -> Engine
    {
        Engine
        {
            cache: RecordCache::new(),
            queries: QueryEngine::new(),
            responder,
            events,
            closed: false
        }
    }

    /// Process one received message and collect the replies it warrants.
    pub fn handle_message(&mut self, message: &DnsMessage, now: Instant) -> Vec<Outgoing>
    {
        if self.closed
        {
            return Vec::new();
        }

        let mut outgoing = Vec::new();

        if message.is_response()
        {
            // A peer answering with one of our announced names means we lost
            // it; withdraw and tell the listener.
            for instance in self.responder.note_conflicts(message)
            {
                let record = self.responder.record_of(&instance);

                match self.responder.goodbye(&instance)
                {
                    Ok(packet) => outgoing.push(Outgoing::multicast(packet)),
                    Err(err) =>
                    {
                        debug!("Failed to withdraw {}: {}", instance, err);
                    }
                }

                if let Some(record) = record
                {
                    warn!("Registered service lost its name: {}", instance);
                    let _ = self.events.send(DiscoveryEvent
                    {
                        action: DiscoveryAction::NameLost,
                        service: record
                    });
                }
            }

            let mut touched = Vec::new();
            for answer in message.records()
            {
                touched.extend(self.cache.apply(answer, now));
            }
            touched.sort();
            touched.dedup();

            self.queries.sync_instances(&touched, &self.cache, &self.events, now);
        }
        else
        {
            // A competing prober shows up in the authority section.
            self.responder.note_conflicts(message);

            for answer_set in self.responder.answer_questions(message)
            {
                match dns::new_response(&answer_set.records)
                {
                    Ok(packet) =>
                    {
                        outgoing.push(Outgoing
                        {
                            buffer: packet,
                            unicast: answer_set.unicast
                        });
                    },
                    Err(err) =>
                    {
                        debug!("Failed to build reply: {}", err);
                    }
                }
            }
        }

        outgoing
    }

    /// Periodic work: due queries and announcements, cache expiry.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing>
    {
        if self.closed
        {
            return Vec::new();
        }

        let mut outgoing = Vec::new();

        for packet in self.queries.due_queries(&self.cache, now)
        {
            outgoing.push(Outgoing::multicast(packet));
        }

        for packet in self.responder.due_announcements(now)
        {
            outgoing.push(Outgoing::multicast(packet));
        }

        let removed = self.cache.expire_older_than(now);
        if !removed.is_empty()
        {
            self.queries.sync_instances(&removed, &self.cache, &self.events, now);
        }

        outgoing
    }

    /// Withdraw all registrations, end all watches and refuse further work.
    /// The second call is a no-op.
    pub fn shutdown(&mut self) -> Vec<Outgoing>
    {
        if self.closed
        {
            return Vec::new();
        }

        self.closed = true;
        self.queries.clear();

        self.responder
            .goodbye_all()
            .into_iter()
            .map(Outgoing::multicast)
            .collect()
    }

    pub fn is_closed(&self) -> bool
    {
        return self.closed;
    }
}

/// Native-socket engine: owns the transport, the receive loops and the
/// scheduler, and serializes everything through the shared state.
pub struct NativeEngine
{
    state: Arc<Mutex<Engine>>,
    transport: Arc<Mutex<MulticastTransport>>,
    running: Arc<AtomicBool>,
    hostname: String,
    _threads: Vec<thread::JoinHandle<()>>
}

pub fn local_hostname() -> Result<String, ZeroConfError>
{
    let name = hostname::get()?;
    let name = name.to_string_lossy();
    let name = name.trim_end_matches('.');

    if name.is_empty()
    {
        return Err(ZeroConfError::NotAvailable);
    }

    if name.ends_with(".local")
    {
        return Ok(name.to_string());
    }

    Ok(format!("{}.local", name))
}

impl NativeEngine
{
    pub fn open(events: mpsc::Sender<DiscoveryEvent>) -> Result<NativeEngine, ZeroConfError>
    {
        let transport = MulticastTransport::open()?;
        let hostname = local_hostname()?;

        let responder = Responder::new(
            hostname.clone(),
            transport.local_v4_addresses().clone(),
            transport.local_v6_addresses().clone()
        );

        let receive_sockets = transport.receive_sockets();

        let state = Arc::new(Mutex::new(Engine::new(responder, events)));
        let transport = Arc::new(Mutex::new(transport));
        let running = Arc::new(AtomicBool::new(true));

        let mut threads = Vec::new();

        for socket in receive_sockets
        {
            let state = state.clone();
            let transport = transport.clone();
            let running = running.clone();

            threads.push(thread::spawn(move ||
            {
                receive_loop(socket, state, transport, running);
            }));
        }

        {
            let state = state.clone();
            let transport = transport.clone();
            let running = running.clone();

            threads.push(thread::spawn(move ||
            {
                scheduler_loop(state, transport, running);
            }));
        }

        Ok(NativeEngine
        {
            state,
            transport,
            running,
            hostname,
            _threads: threads
        })
    }

    fn send_outgoing(&self, outgoing: Vec<Outgoing>)
    {
        let transport = self.transport.lock().unwrap();
        send_all(&transport, outgoing, None);
    }

    pub fn watch(&self, service_type: ServiceType) -> Result<WatchId, ZeroConfError>
    {
        if !self.running.load(Ordering::Relaxed)
        {
            return Err(ZeroConfError::Closed);
        }

        let now = Instant::now();
        let (id, outgoing) =
        {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;

            let dns_name = service_type.dns_name();
            let id = state.queries.watch(service_type, now)?;

            // Instances another session already pulled into the cache are
            // reported right away.
            let known = state.cache.instances_of(&dns_name);
            state.queries.sync_instances(&known, &state.cache, &state.events, now);

            // First query goes out immediately.
            let outgoing = state.tick(now);
            (id, outgoing)
        };

        self.send_outgoing(outgoing);
        Ok(id)
    }

    pub fn unwatch(&self, service_type: &ServiceType) -> Result<(), ZeroConfError>
    {
        if !self.running.load(Ordering::Relaxed)
        {
            return Err(ZeroConfError::Closed);
        }

        self.state.lock().unwrap().queries.unwatch(service_type)
    }

    /// Probe for the requested name, renaming on conflict, then announce.
    /// Blocks the caller for the probe window. Returns the name actually
    /// registered.
    pub fn register(
        &self,
        service_type: &ServiceType,
        name: &str,
        port: u16,
        props: &HashMap<String, String>
    ) -> Result<String, ZeroConfError>
    {
        if !self.running.load(Ordering::Relaxed)
        {
            return Err(ZeroConfError::Closed);
        }

        let mut current = name.to_string();

        for attempt in 0..responder::MAX_RENAME_ATTEMPTS
        {
            let now = Instant::now();
            let (instance, probe) =
            {
                let mut state = self.state.lock().unwrap();
                if state.is_closed()
                {
                    return Err(ZeroConfError::Closed);
                }

                let record = state.responder.new_record(service_type, &current, port, props);
                let instance = state.responder.begin_probe(record, now)?;
                let probe = state.responder.probe_packet(&instance)?;
                (instance, probe)
            };

            let mut conflict = false;
            for _ in 0..responder::PROBE_ATTEMPTS
            {
                self.transport.lock().unwrap().send(&probe)?;
                thread::sleep(responder::PROBE_INTERVAL);

                if self.state.lock().unwrap().responder.has_conflict(&instance)
                {
                    conflict = true;
                    break;
                }
            }

            if conflict
            {
                self.state.lock().unwrap().responder.abandon(&instance);
                current = responder::renamed(name, attempt + 2);
                info!("Name conflict for {}, retrying as {}", instance, current);
                continue;
            }

            let packet = self.state.lock().unwrap().responder.commit(&instance, Instant::now())?;
            self.transport.lock().unwrap().send(&packet)?;

            info!("Registered service {}", instance);
            return Ok(current);
        }

        Err(ZeroConfError::NameConflict)
    }

    pub fn unregister(&self, service_type: &ServiceType, name: &str) -> Result<(), ZeroConfError>
    {
        if !self.running.load(Ordering::Relaxed)
        {
            return Err(ZeroConfError::Closed);
        }

        let instance = service_type.instance_name(name);
        let packet = self.state.lock().unwrap().responder.goodbye(&instance)?;
        self.transport.lock().unwrap().send(&packet)?;

        Ok(())
    }

    /// Withdraw every registered service; watches keep running.
    pub fn stop(&self) -> Result<(), ZeroConfError>
    {
        if !self.running.load(Ordering::Relaxed)
        {
            return Err(ZeroConfError::Closed);
        }

        let packets = self.state.lock().unwrap().responder.goodbye_all();
        let transport = self.transport.lock().unwrap();
        for packet in packets
        {
            if let Err(err) = transport.send(&packet)
            {
                debug!("Failed to send goodbye: {}", err);
            }
        }

        Ok(())
    }

    /// Withdraw everything and release the transport. Idempotent.
    pub fn close(&self) -> Result<(), ZeroConfError>
    {
        if !self.running.swap(false, Ordering::Relaxed)
        {
            return Ok(());
        }

        let outgoing = self.state.lock().unwrap().shutdown();

        let mut transport = self.transport.lock().unwrap();
        send_all(&transport, outgoing, None);
        transport.close();

        info!("ZeroConf engine closed");
        Ok(())
    }

    pub fn hostname(&self) -> &str
    {
        return &self.hostname;
    }
}

impl Drop for NativeEngine
{
    fn drop(&mut self)
    {
        let _ = self.close();
    }
}

fn send_all(transport: &MulticastTransport, outgoing: Vec<Outgoing>, peer: Option<SocketAddr>)
{
    for out in outgoing
    {
        let result = match (out.unicast, peer)
        {
            (true, Some(addr)) => transport.send_unicast(&out.buffer, addr),
            _ => transport.send(&out.buffer)
        };

        if let Err(err) = result
        {
            debug!("Failed to send packet: {}", err);
        }
    }
}

fn receive_loop(
    socket: UdpSocket,
    state: Arc<Mutex<Engine>>,
    transport: Arc<Mutex<MulticastTransport>>,
    running: Arc<AtomicBool>
)
{
    let mut buffer: [u8; 4096] = [0u8; 4096];

    loop
    {
        if !running.load(Ordering::Relaxed)
        {
            break;
        }

        let (count, addr) = match socket.recv_from(&mut buffer)
        {
            Ok((count, addr)) => (count, addr),
            Err(err) =>
            {
                match err.kind()
                {
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    },
                    _ =>
                    {
                        debug!("Failed to receive data: {}", err);
                        thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                }
            }
        };

        debug!("Received {} bytes from {}", count, addr);

        let message = match DnsMessage::from(&buffer[..count])
        {
            Ok(message) => message,
            Err(err) =>
            {
                // A bad datagram must not take down the loop.
                debug!("Dropping malformed packet from {}: {}\n{}", addr, err, Hex::new(&buffer, count));
                continue;
            }
        };

        let outgoing = state.lock().unwrap().handle_message(&message, Instant::now());
        if !outgoing.is_empty()
        {
            let transport = transport.lock().unwrap();
            send_all(&transport, outgoing, Some(addr));
        }
    }
}

fn scheduler_loop(
    state: Arc<Mutex<Engine>>,
    transport: Arc<Mutex<MulticastTransport>>,
    running: Arc<AtomicBool>
)
{
    loop
    {
        if !running.load(Ordering::Relaxed)
        {
            break;
        }

        thread::sleep(SCHEDULER_TICK);

        let outgoing = state.lock().unwrap().tick(Instant::now());
        if !outgoing.is_empty()
        {
            let transport = transport.lock().unwrap();
            send_all(&transport, outgoing, None);
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use std::net::Ipv4Addr;
    use crate::dns::{ AAnswer, Answer, PtrAnswer, SrvAnswer, TxtAnswer };
    use crate::responder::{ HOST_RECORD_TTL, SERVICE_RECORD_TTL };

    fn engine() -> (Engine, mpsc::Receiver<DiscoveryEvent>)
    {
        let (tx, rx) = mpsc::channel();
        let responder = Responder::new(
            "myhost.local".to_string(),
            vec![Ipv4Addr::new(192, 0, 2, 10)],
            Vec::new()
        );

        (Engine::new(responder, tx), rx)
    }

    fn http_type() -> ServiceType
    {
        ServiceType::new("_http._tcp.", "local.").unwrap()
    }

    fn peer_announcement(name: &str, port: u16, addr: Ipv4Addr, ttl: u32) -> DnsMessage
    {
        let instance = format!("{}._http._tcp.local", name);
        let target = format!("{}host.local", name);

        let records = vec![
            Answer::Ptr(PtrAnswer
            {
                label: "_http._tcp.local".to_string(),
                service: instance.clone(),
                ttl: if ttl == 0 { 0 } else { SERVICE_RECORD_TTL.min(ttl) }
            }),
            Answer::Srv(SrvAnswer
            {
                label: instance.clone(),
                target: target.clone(),
                port,
                ttl: if ttl == 0 { 0 } else { HOST_RECORD_TTL.min(ttl) },
                cache_flush: true
            }),
            Answer::Txt(TxtAnswer
            {
                label: instance,
                records: Vec::new(),
                ttl: if ttl == 0 { 0 } else { SERVICE_RECORD_TTL.min(ttl) },
                cache_flush: true
            }),
            Answer::A(AAnswer
            {
                label: target,
                address: addr,
                ttl: if ttl == 0 { 0 } else { HOST_RECORD_TTL.min(ttl) },
                cache_flush: true
            })
        ];

        let packet = dns::new_response(&records).unwrap();
        DnsMessage::from(&packet).unwrap()
    }

    #[test]
    fn test_watch_yields_added_then_resolved()
    {
        let now = Instant::now();
        let (mut engine, events) = engine();

        engine.queries.watch(http_type(), now).unwrap();

        let message = peer_announcement("printer", 80, Ipv4Addr::new(192, 0, 2, 5), HOST_RECORD_TTL);
        engine.handle_message(&message, now);

        let added = events.try_recv().unwrap();
        assert_eq!(added.action, DiscoveryAction::Added);
        assert_eq!(added.service.name, "printer");

        let resolved = events.try_recv().unwrap();
        assert_eq!(resolved.action, DiscoveryAction::Resolved);
        assert_eq!(resolved.service.port, 80);
        assert_eq!(resolved.service.ipv4_addresses, vec![Ipv4Addr::new(192, 0, 2, 5)]);

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_no_double_added_without_removed()
    {
        let now = Instant::now();
        let (mut engine, events) = engine();

        engine.queries.watch(http_type(), now).unwrap();

        let message = peer_announcement("printer", 80, Ipv4Addr::new(192, 0, 2, 5), HOST_RECORD_TTL);
        engine.handle_message(&message, now);
        engine.handle_message(&message, now + Duration::from_secs(1));

        let mut actions = Vec::new();
        while let Ok(event) = events.try_recv()
        {
            actions.push(event.action);
        }
        assert_eq!(actions, vec![DiscoveryAction::Added, DiscoveryAction::Resolved]);

        // Goodbye, then the service comes back: a fresh added is allowed.
        let goodbye = peer_announcement("printer", 80, Ipv4Addr::new(192, 0, 2, 5), 0);
        engine.handle_message(&goodbye, now + Duration::from_secs(2));
        assert_eq!(events.try_recv().unwrap().action, DiscoveryAction::Removed);

        engine.handle_message(&message, now + Duration::from_secs(3));
        assert_eq!(events.try_recv().unwrap().action, DiscoveryAction::Added);
        assert_eq!(events.try_recv().unwrap().action, DiscoveryAction::Resolved);
    }

    #[test]
    fn test_cache_expiry_emits_removed()
    {
        let now = Instant::now();
        let (mut engine, events) = engine();

        engine.queries.watch(http_type(), now).unwrap();

        let message = peer_announcement("printer", 80, Ipv4Addr::new(192, 0, 2, 5), 2);
        engine.handle_message(&message, now);
        events.try_recv().unwrap();
        events.try_recv().unwrap();

        // Nothing expires before the TTL runs out.
        engine.tick(now + Duration::from_secs(1));
        assert!(events.try_recv().is_err());

        engine.tick(now + Duration::from_secs(2));
        assert_eq!(events.try_recv().unwrap().action, DiscoveryAction::Removed);
    }

    #[test]
    fn test_events_only_for_matching_type()
    {
        let now = Instant::now();
        let (mut engine, events) = engine();

        let other = ServiceType::new("_ssh._tcp.", "local.").unwrap();
        engine.queries.watch(other, now).unwrap();

        let message = peer_announcement("printer", 80, Ipv4Addr::new(192, 0, 2, 5), HOST_RECORD_TTL);
        engine.handle_message(&message, now);

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_registered_service_answers_peer_query()
    {
        let now = Instant::now();
        let (mut engine, _events) = engine();

        let record = engine.responder.new_record(&http_type(), "srv", 8080, &HashMap::new());
        let instance = engine.responder.begin_probe(record, now).unwrap();
        engine.responder.commit(&instance, now).unwrap();

        let query = dns::new_query("_http._tcp.local", &[]).unwrap();
        let message = DnsMessage::from(&query).unwrap();

        let outgoing = engine.handle_message(&message, now);
        assert_eq!(outgoing.len(), 1);
        assert!(!outgoing[0].unicast);

        let reply = DnsMessage::from(&outgoing[0].buffer).unwrap();
        assert!(reply.is_response());
        assert!(reply.is_authoritative());

        let mut has_srv = false;
        let mut has_txt = false;
        let mut has_a = false;
        for answer in reply.answers.iter()
        {
            match answer
            {
                Answer::Srv(srv) =>
                {
                    assert_eq!(srv.label, "srv._http._tcp.local");
                    assert_eq!(srv.port, 8080);
                    has_srv = true;
                },
                Answer::Txt(_) => has_txt = true,
                Answer::A(_) => has_a = true,
                _ => {}
            }
        }
        assert!(has_srv && has_txt && has_a);
    }

    #[test]
    fn test_lost_name_is_withdrawn_with_event()
    {
        let now = Instant::now();
        let (mut engine, events) = engine();

        let record = engine.responder.new_record(&http_type(), "srv", 8080, &HashMap::new());
        let instance = engine.responder.begin_probe(record, now).unwrap();
        engine.responder.commit(&instance, now).unwrap();

        // Another authoritative responder claims the same instance name.
        let conflict = vec![
            Answer::Srv(SrvAnswer
            {
                label: instance.clone(),
                target: "otherhost.local".to_string(),
                port: 9999,
                ttl: HOST_RECORD_TTL,
                cache_flush: true
            })
        ];
        let packet = dns::new_response(&conflict).unwrap();
        let message = DnsMessage::from(&packet).unwrap();

        let outgoing = engine.handle_message(&message, now);

        // A goodbye goes out for the lost name.
        assert_eq!(outgoing.len(), 1);
        let goodbye = DnsMessage::from(&outgoing[0].buffer).unwrap();
        assert!(goodbye.answers.iter().all(|answer| answer.ttl() == 0));

        let event = events.try_recv().unwrap();
        assert_eq!(event.action, DiscoveryAction::NameLost);
        assert_eq!(event.service.name, "srv");

        assert!(engine.responder.is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent()
    {
        let now = Instant::now();
        let (mut engine, events) = engine();

        engine.queries.watch(http_type(), now).unwrap();
        let record = engine.responder.new_record(&http_type(), "srv", 8080, &HashMap::new());
        let instance = engine.responder.begin_probe(record, now).unwrap();
        engine.responder.commit(&instance, now).unwrap();

        let first = engine.shutdown();
        assert_eq!(first.len(), 1);
        assert!(engine.is_closed());

        // Second shutdown: nothing to send, nothing to report.
        let second = engine.shutdown();
        assert!(second.is_empty());

        // A closed engine ignores traffic.
        let message = peer_announcement("printer", 80, Ipv4Addr::new(192, 0, 2, 5), HOST_RECORD_TTL);
        assert!(engine.handle_message(&message, now).is_empty());
        assert!(engine.tick(now).is_empty());
        assert!(events.try_recv().is_err());
    }
}
