use std::collections::HashMap;
use std::net::{ Ipv4Addr, Ipv6Addr };
use std::time::{ Duration, Instant };
use log::debug;

use crate::dns;
use crate::dns::{ AAnswer, AaaaAnswer, Answer, DnsMessage, PtrAnswer, SrvAnswer, TxtAnswer, Type };
use crate::service::{ ServiceRecord, ServiceType, txt_map_to_records };
use crate::zeroconf_error::ZeroConfError;

// Probe and announce cadence per mDNS convention.
pub const PROBE_ATTEMPTS: u32 = 3;
pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);
pub const MAX_RENAME_ATTEMPTS: u32 = 10;

const ANNOUNCE_COUNT: u32 = 4;
const ANNOUNCE_INTERVAL_START: Duration = Duration::from_secs(1);
const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

// Host-bound records use the short TTL, shared records the long one.
pub const HOST_RECORD_TTL: u32 = 120;
pub const SERVICE_RECORD_TTL: u32 = 4500;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegistrationPhase
{
    Probing,
    Announced,
    Active,
    Withdrawn
}

struct Registration
{
    record: ServiceRecord,
    phase: RegistrationPhase,
    conflict_seen: bool,
    announcements_sent: u32,
    announce_interval: Duration,
    next_announce_at: Instant
}

/// Records to send back for one incoming query.
pub struct AnswerSet
{
    pub records: Vec<Answer>,
    pub unicast: bool
}

/// Conflict-resolution candidate: `printer` becomes `printer (2)` and so on,
/// the way Bonjour renames.
pub fn renamed(name: &str, attempt: u32) -> String
{
    format!("{} ({})", name, attempt)
}

/// Answers queries for locally registered services and walks each
/// registration through Probing -> Announced -> Active -> Withdrawn.
pub struct Responder
{
    registrations: HashMap<String, Registration>,
    hostname: String,
    v4_addresses: Vec<Ipv4Addr>,
    v6_addresses: Vec<Ipv6Addr>
}

impl Responder
{
    pub fn new(hostname: String, v4_addresses: Vec<Ipv4Addr>, v6_addresses: Vec<Ipv6Addr>) -> Responder
    {
        Responder
        {
            registrations: HashMap::new(),
            hostname,
            v4_addresses,
            v6_addresses
        }
    }

    /// Build the record a registration request will publish, carrying the
    /// local hostname and addresses.
    pub fn new_record(&self, service_type: &ServiceType, name: &str, port: u16, props: &HashMap<String, String>) -> ServiceRecord
    {
        let mut record = ServiceRecord::new(name, service_type.clone());
        record.port = port;
        record.hostname = self.hostname.clone();
        record.ipv4_addresses = self.v4_addresses.clone();
        record.ipv6_addresses = self.v6_addresses.clone();
        record.txt_record = props.clone();
        record.ttl = SERVICE_RECORD_TTL;

        record
    }

    pub fn begin_probe(&mut self, record: ServiceRecord, now: Instant) -> Result<String, ZeroConfError>
    {
        let instance = record.service_type.instance_name(&record.name);

        if self.registrations.contains_key(&instance)
        {
            return Err(ZeroConfError::ServiceAlreadyRegistered);
        }

        debug!("Probing for instance name {}", instance);

        self.registrations.insert(instance.clone(), Registration
        {
            record,
            phase: RegistrationPhase::Probing,
            conflict_seen: false,
            announcements_sent: 0,
            announce_interval: ANNOUNCE_INTERVAL_START,
            next_announce_at: now
        });

        Ok(instance)
    }

    pub fn probe_packet(&self, instance: &str) -> Result<Vec<u8>, ZeroConfError>
    {
        let registration = match self.registrations.get(instance)
        {
            Some(registration) => registration,
            None => return Err(ZeroConfError::ServiceNotRegistered)
        };

        dns::new_probe(
            instance,
            &self.hostname,
            registration.record.port,
            &txt_map_to_records(&registration.record.txt_record),
            HOST_RECORD_TTL
        )
    }

    pub fn has_conflict(&self, instance: &str) -> bool
    {
        match self.registrations.get(instance)
        {
            Some(registration) => registration.conflict_seen,
            None => false
        }
    }

    /// Abandon a probing registration, e.g. to retry under another name.
    pub fn abandon(&mut self, instance: &str)
    {
        self.registrations.remove(instance);
    }

    /// Probe window passed without conflict: announce and move on. Returns
    /// the first announcement packet.
    pub fn commit(&mut self, instance: &str, now: Instant) -> Result<Vec<u8>, ZeroConfError>
    {
        let hostname = self.hostname.clone();
        let v4 = self.v4_addresses.clone();
        let v6 = self.v6_addresses.clone();

        let registration = match self.registrations.get_mut(instance)
        {
            Some(registration) => registration,
            None => return Err(ZeroConfError::ServiceNotRegistered)
        };

        if registration.phase != RegistrationPhase::Probing
        {
            return Err(ZeroConfError::ServiceAlreadyRegistered);
        }

        registration.phase = RegistrationPhase::Announced;
        registration.announcements_sent = 1;
        registration.next_announce_at = now + registration.announce_interval;
        registration.announce_interval *= 2;

        let records = announcement_records(&registration.record, &hostname, &v4, &v6);
        dns::new_response(&records)
    }

    /// Inspect a received message for records that claim one of our names.
    /// During probing this just flags the conflict; for an announced name it
    /// returns the instances that lost, for the caller to withdraw.
    pub fn note_conflicts(&mut self, message: &DnsMessage) -> Vec<String>
    {
        let mut lost = Vec::new();

        let records: Vec<&Answer> = if message.is_response()
        {
            message.records().collect()
        }
        else
        {
            // A query's authority section carries a competing prober's
            // proposed records.
            message.authorities.iter().collect()
        };

        for answer in records
        {
            let srv = match answer
            {
                Answer::Srv(srv) => srv,
                _ => continue
            };

            let registration = match self.registrations.get_mut(&srv.label)
            {
                Some(registration) => registration,
                None => continue
            };

            // Our own records looped back from the group are not a conflict.
            if srv.target == self.hostname && srv.port == registration.record.port
            {
                continue;
            }

            match registration.phase
            {
                RegistrationPhase::Probing =>
                {
                    debug!("Conflicting reply for probed name {}", srv.label);
                    registration.conflict_seen = true;
                },
                RegistrationPhase::Announced | RegistrationPhase::Active =>
                {
                    if message.is_response() && message.is_authoritative()
                    {
                        lost.push(srv.label.clone());
                    }
                },
                RegistrationPhase::Withdrawn => {}
            }
        }

        lost
    }

    /// Build replies for the questions we are authoritative for. One set per
    /// incoming message; unicast only when every matched question asked for
    /// it.
    pub fn answer_questions(&self, message: &DnsMessage) -> Vec<AnswerSet>
    {
        let mut records: Vec<Answer> = Vec::new();
        let mut unicast = true;
        let mut matched = false;

        for question in message.questions.iter()
        {
            let mut question_records: Vec<Answer> = Vec::new();

            for registration in self.registrations.values()
            {
                if registration.phase != RegistrationPhase::Announced
                    && registration.phase != RegistrationPhase::Active
                {
                    continue;
                }

                let instance = registration.record.service_type.instance_name(&registration.record.name);
                let service_name = registration.record.service_type.dns_name();

                let wants_ptr = (question.qtype == Type::PTR || question.qtype == Type::ANY)
                    && question.label == service_name;
                let wants_instance = (question.qtype == Type::SRV || question.qtype == Type::TXT || question.qtype == Type::ANY)
                    && question.label == instance;
                let wants_host = (question.qtype == Type::A || question.qtype == Type::AAAA || question.qtype == Type::ANY)
                    && question.label == self.hostname;

                if wants_ptr
                {
                    if known_answer_suppressed(message, &service_name, &instance)
                    {
                        debug!("Known-answer suppression for {}", instance);
                        continue;
                    }

                    question_records.extend(announcement_records(
                        &registration.record,
                        &self.hostname,
                        &self.v4_addresses,
                        &self.v6_addresses
                    ));
                }
                else if wants_instance
                {
                    question_records.extend(instance_records(
                        &registration.record,
                        &self.hostname,
                        &self.v4_addresses,
                        &self.v6_addresses
                    ));
                }
                else if wants_host
                {
                    question_records.extend(address_records(&self.hostname, &self.v4_addresses, &self.v6_addresses));
                }
            }

            if !question_records.is_empty()
            {
                matched = true;
                unicast = unicast && question.unicast_response;

                for record in question_records
                {
                    if !records.contains(&record)
                    {
                        records.push(record);
                    }
                }
            }
        }

        if !matched
        {
            return Vec::new();
        }

        vec![AnswerSet { records, unicast }]
    }

    /// Announcement repeats and steady-state refreshes that are due.
    pub fn due_announcements(&mut self, now: Instant) -> Vec<Vec<u8>>
    {
        let mut packets = Vec::new();

        for registration in self.registrations.values_mut()
        {
            if registration.phase != RegistrationPhase::Announced
                && registration.phase != RegistrationPhase::Active
            {
                continue;
            }

            if now < registration.next_announce_at
            {
                continue;
            }

            let records = announcement_records(
                &registration.record,
                &self.hostname,
                &self.v4_addresses,
                &self.v6_addresses
            );

            match dns::new_response(&records)
            {
                Ok(packet) => packets.push(packet),
                Err(err) =>
                {
                    debug!("Failed to build announcement: {}", err);
                    continue;
                }
            }

            registration.announcements_sent += 1;

            if registration.announcements_sent >= ANNOUNCE_COUNT
            {
                registration.phase = RegistrationPhase::Active;
                registration.next_announce_at = now + REANNOUNCE_INTERVAL;
            }
            else
            {
                registration.next_announce_at = now + registration.announce_interval;
                registration.announce_interval *= 2;
            }
        }

        packets
    }

    pub fn record_of(&self, instance: &str) -> Option<ServiceRecord>
    {
        self.registrations.get(instance).map(|registration| registration.record.clone())
    }

    #[cfg(test)]
    fn phase_of(&self, instance: &str) -> Option<RegistrationPhase>
    {
        self.registrations.get(instance).map(|registration| registration.phase)
    }

    /// Withdraw one registration with a goodbye packet (all records TTL 0).
    pub fn goodbye(&mut self, instance: &str) -> Result<Vec<u8>, ZeroConfError>
    {
        let mut registration = match self.registrations.remove(instance)
        {
            Some(registration) => registration,
            None => return Err(ZeroConfError::ServiceNotRegistered)
        };

        registration.phase = RegistrationPhase::Withdrawn;
        debug!("Withdrawing {}", instance);

        let records = goodbye_records(&registration.record, &self.hostname);
        dns::new_response(&records)
    }

    /// Withdraw everything, for `stop` and `close`.
    pub fn goodbye_all(&mut self) -> Vec<Vec<u8>>
    {
        let instances: Vec<String> = self.registrations.keys().cloned().collect();
        let mut packets = Vec::new();

        for instance in instances
        {
            match self.goodbye(&instance)
            {
                Ok(packet) => packets.push(packet),
                Err(err) =>
                {
                    debug!("Failed to withdraw {}: {}", instance, err);
                }
            }
        }

        packets
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool
    {
        return self.registrations.is_empty();
    }
}

fn known_answer_suppressed(message: &DnsMessage, service_name: &str, instance: &str) -> bool
{
    message.answers.iter().any(|answer| match answer
    {
        Answer::Ptr(ptr) =>
        {
            ptr.label == service_name && ptr.service == instance && ptr.ttl > SERVICE_RECORD_TTL / 2
        },
        _ => false
    })
}

fn announcement_records(record: &ServiceRecord, hostname: &str, v4: &[Ipv4Addr], v6: &[Ipv6Addr]) -> Vec<Answer>
{
    let instance = record.service_type.instance_name(&record.name);
    let mut records = vec![
        Answer::Ptr(PtrAnswer
        {
            label: record.service_type.dns_name(),
            service: instance,
            ttl: SERVICE_RECORD_TTL
        })
    ];

    records.extend(instance_records(record, hostname, v4, v6));
    records
}

fn instance_records(record: &ServiceRecord, hostname: &str, v4: &[Ipv4Addr], v6: &[Ipv6Addr]) -> Vec<Answer>
{
    let instance = record.service_type.instance_name(&record.name);

    let mut records = vec![
        Answer::Srv(SrvAnswer
        {
            label: instance.clone(),
            target: hostname.to_string(),
            port: record.port,
            ttl: HOST_RECORD_TTL,
            cache_flush: true
        }),
        Answer::Txt(TxtAnswer
        {
            label: instance,
            records: txt_map_to_records(&record.txt_record),
            ttl: SERVICE_RECORD_TTL,
            cache_flush: true
        })
    ];

    records.extend(address_records(hostname, v4, v6));
    records
}

fn address_records(hostname: &str, v4: &[Ipv4Addr], v6: &[Ipv6Addr]) -> Vec<Answer>
{
    let mut records = Vec::new();

    for address in v4
    {
        records.push(Answer::A(AAnswer
        {
            label: hostname.to_string(),
            address: *address,
            ttl: HOST_RECORD_TTL,
            cache_flush: true
        }));
    }

    for address in v6
    {
        records.push(Answer::Aaaa(AaaaAnswer
        {
            label: hostname.to_string(),
            address: *address,
            ttl: HOST_RECORD_TTL,
            cache_flush: true
        }));
    }

    records
}

fn goodbye_records(record: &ServiceRecord, hostname: &str) -> Vec<Answer>
{
    let instance = record.service_type.instance_name(&record.name);

    vec![
        Answer::Ptr(PtrAnswer
        {
            label: record.service_type.dns_name(),
            service: instance.clone(),
            ttl: 0
        }),
        Answer::Srv(SrvAnswer
        {
            label: instance.clone(),
            target: hostname.to_string(),
            port: record.port,
            ttl: 0,
            cache_flush: false
        }),
        Answer::Txt(TxtAnswer
        {
            label: instance,
            records: txt_map_to_records(&record.txt_record),
            ttl: 0,
            cache_flush: false
        })
    ]
}
