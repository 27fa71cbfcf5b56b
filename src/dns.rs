use std::net::{ Ipv4Addr, Ipv6Addr };

use crate::zeroconf_error::ZeroConfError;

pub const FLAGS_QR_MASK: u16 = 0x8000;
pub const FLAGS_QR_RESPONSE: u16 = 0x8000;
pub const FLAGS_AA: u16 = 0x0400;

// Top bit of the class field: unicast-response on questions, cache-flush on
// records.
const CLASS_TOP_BIT: u16 = 0x8000;
const CLASS_IN: u16 = 0x0001;

const MAX_COMPRESSION_POINTERS: u8 = 126;
const MAX_LABEL_LEN: usize = 63;
const MAX_TXT_STRING_LEN: usize = 255;

#[derive(Clone, PartialEq)]
pub enum Answer
{
    Ptr(PtrAnswer),
    Srv(SrvAnswer),
    Txt(TxtAnswer),
    A(AAnswer),
    Aaaa(AaaaAnswer)
}

#[derive(Clone, Debug, PartialEq)]
pub struct PtrAnswer
{
    pub label: String,
    pub service: String,
    pub ttl: u32
}

#[derive(Clone, Debug, PartialEq)]
pub struct SrvAnswer
{
    pub label: String,
    pub target: String,
    pub port: u16,
    pub ttl: u32,
    pub cache_flush: bool
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxtAnswer
{
    pub label: String,
    pub records: Vec<String>,
    pub ttl: u32,
    pub cache_flush: bool
}

#[derive(Clone, Debug, PartialEq)]
pub struct AAnswer
{
    pub label: String,
    pub address: Ipv4Addr,
    pub ttl: u32,
    pub cache_flush: bool
}

#[derive(Clone, Debug, PartialEq)]
pub struct AaaaAnswer
{
    pub label: String,
    pub address: Ipv6Addr,
    pub ttl: u32,
    pub cache_flush: bool
}

impl Answer
{
    pub fn ttl(&self) -> u32
    {
        match self
        {
            Answer::Ptr(answer) => answer.ttl,
            Answer::Srv(answer) => answer.ttl,
            Answer::Txt(answer) => answer.ttl,
            Answer::A(answer) => answer.ttl,
            Answer::Aaaa(answer) => answer.ttl
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Question
{
    pub label: String,
    pub qtype: Type,
    pub unicast_response: bool
}

pub struct DnsHeader
{
    id: u16,
    flags: u16,
    queries_len: u16,
    answers_len: u16,
    authorities_len: u16,
    additional_len: u16
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type
{
    A = 1,
    NS = 2,
    CNAME = 5,
    SOA = 6,
    PTR = 12,
    MX = 15,
    TXT = 16,
    AAAA = 28,
    SRV = 33,
    OPT = 41,
    NSEC = 47,
    ANY = 255
}

impl DnsHeader
{
    pub fn from(buffer: &[u8]) -> Result<DnsHeader, ZeroConfError>
    {
        if buffer.len() < 12
        {
            return Err(ZeroConfError::InvalidHeader);
        }

        let id = u16::from_be_bytes([buffer[0], buffer[1]]);
        let flags = u16::from_be_bytes([buffer[2], buffer[3]]);
        let queries_len = u16::from_be_bytes([buffer[4], buffer[5]]);
        let answers_len = u16::from_be_bytes([buffer[6], buffer[7]]);
        let authorities_len = u16::from_be_bytes([buffer[8], buffer[9]]);
        let additional_len = u16::from_be_bytes([buffer[10], buffer[11]]);

        Ok(DnsHeader
        {
            id,
            flags,
            queries_len,
            answers_len,
            authorities_len,
            additional_len
        })
    }

    pub fn to_bytes(&self) -> Vec<u8>
    {
        let mut buffer = Vec::new();

        buffer.extend_from_slice(&self.id.to_be_bytes());
        buffer.extend_from_slice(&self.flags.to_be_bytes());
        buffer.extend_from_slice(&self.queries_len.to_be_bytes());
        buffer.extend_from_slice(&self.answers_len.to_be_bytes());
        buffer.extend_from_slice(&self.authorities_len.to_be_bytes());
        buffer.extend_from_slice(&self.additional_len.to_be_bytes());

        buffer
    }
}

/// A decoded mDNS message: questions plus the three record sections. Records
/// of types we do not track are skipped over, not errors.
#[derive(Debug)]
pub struct DnsMessage
{
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Answer>,
    pub authorities: Vec<Answer>,
    pub additionals: Vec<Answer>
}

impl DnsMessage
{
    pub fn from(buffer: &[u8]) -> Result<DnsMessage, ZeroConfError>
    {
        let header = DnsHeader::from(buffer)?;

        let mut message = DnsMessage
        {
            id: header.id,
            flags: header.flags,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new()
        };

        let mut offset: usize = 12;

        for _ in 0..header.queries_len
        {
            offset = parse_question(buffer, offset, &mut message.questions)?;
        }

        for _ in 0..header.answers_len
        {
            offset = parse_record(buffer, offset, &mut message.answers)?;
        }

        for _ in 0..header.authorities_len
        {
            offset = parse_record(buffer, offset, &mut message.authorities)?;
        }

        for _ in 0..header.additional_len
        {
            offset = parse_record(buffer, offset, &mut message.additionals)?;
        }

        Ok(message)
    }

    pub fn is_response(&self) -> bool
    {
        return self.flags & FLAGS_QR_MASK == FLAGS_QR_RESPONSE;
    }

    pub fn is_authoritative(&self) -> bool
    {
        return self.flags & FLAGS_AA != 0;
    }

    /// All record sections in one pass, answers first.
    pub fn records(&self) -> impl Iterator<Item = &Answer>
    {
        self.answers.iter().chain(self.authorities.iter()).chain(self.additionals.iter())
    }
}

fn read_u8(buffer: &[u8], offset: usize) -> Result<u8, ZeroConfError>
{
    if offset >= buffer.len()
    {
        return Err(ZeroConfError::TruncatedPacket);
    }

    Ok(buffer[offset])
}

fn read_u16(buffer: &[u8], offset: usize) -> Result<u16, ZeroConfError>
{
    if offset + 2 > buffer.len()
    {
        return Err(ZeroConfError::TruncatedPacket);
    }

    Ok(u16::from_be_bytes([buffer[offset], buffer[offset + 1]]))
}

fn read_u32(buffer: &[u8], offset: usize) -> Result<u32, ZeroConfError>
{
    if offset + 4 > buffer.len()
    {
        return Err(ZeroConfError::TruncatedPacket);
    }

    Ok(u32::from_be_bytes([buffer[offset], buffer[offset + 1], buffer[offset + 2], buffer[offset + 3]]))
}

fn parse_question(buffer: &[u8], mut offset: usize, questions: &mut Vec<Question>) -> Result<usize, ZeroConfError>
{
    let (label, label_end) = read_name(buffer, offset)?;
    offset = label_end;

    let qtype = read_u16(buffer, offset)?;
    let qclass = read_u16(buffer, offset + 2)?;
    offset += 4;

    // Questions for types we never answer are skipped, not an error.
    if let Ok(qtype) = Type::from(qtype)
    {
        questions.push(Question
        {
            label,
            qtype,
            unicast_response: qclass & CLASS_TOP_BIT != 0
        });
    }

    Ok(offset)
}

fn parse_record(buffer: &[u8], mut offset: usize, answers: &mut Vec<Answer>) -> Result<usize, ZeroConfError>
{
    // Parse DNS label.
    let (label, label_end) = read_name(buffer, offset)?;
    offset = label_end;

    let answer_type = read_u16(buffer, offset)?;
    let answer_class = read_u16(buffer, offset + 2)?;
    let ttl = read_u32(buffer, offset + 4)?;
    let answer_data_len = read_u16(buffer, offset + 8)? as usize;
    offset += 10;

    if offset + answer_data_len > buffer.len()
    {
        return Err(ZeroConfError::TruncatedPacket);
    }

    let cache_flush = answer_class & CLASS_TOP_BIT != 0;

    match Type::from(answer_type)
    {
        Ok(Type::A) =>
        {
            // We got an IPv4 address. Parse and return it.
            if answer_data_len != 4
            {
                return Err(ZeroConfError::InvalidRecord);
            }

            let data = Ipv4Addr::new(buffer[offset], buffer[offset + 1], buffer[offset + 2], buffer[offset + 3]);
            offset += 4;

            answers.push(Answer::A(AAnswer { label, address: data, ttl, cache_flush }));
        },
        Ok(Type::AAAA) =>
        {
            // We got an IPv6 address. Parse and return it.
            if answer_data_len != 16
            {
                return Err(ZeroConfError::InvalidRecord);
            }

            let data = Ipv6Addr::new(
                u16::from_be_bytes([buffer[offset], buffer[offset + 1]]),
                u16::from_be_bytes([buffer[offset + 2], buffer[offset + 3]]),
                u16::from_be_bytes([buffer[offset + 4], buffer[offset + 5]]),
                u16::from_be_bytes([buffer[offset + 6], buffer[offset + 7]]),
                u16::from_be_bytes([buffer[offset + 8], buffer[offset + 9]]),
                u16::from_be_bytes([buffer[offset + 10], buffer[offset + 11]]),
                u16::from_be_bytes([buffer[offset + 12], buffer[offset + 13]]),
                u16::from_be_bytes([buffer[offset + 14], buffer[offset + 15]])
            );
            offset += 16;

            answers.push(Answer::Aaaa(AaaaAnswer { label, address: data, ttl, cache_flush }));
        },
        Ok(Type::SRV) =>
        {
            // We got a service record. Skip priority and weight, parse port
            // and target.
            if answer_data_len < 6
            {
                return Err(ZeroConfError::InvalidRecord);
            }

            let port = read_u16(buffer, offset + 4)?;
            offset += 6;

            let (target, label_end) = read_name(buffer, offset)?;
            offset = label_end;

            answers.push(Answer::Srv(SrvAnswer { label, target, port, ttl, cache_flush }));
        },
        Ok(Type::PTR) =>
        {
            // We got a PTR record. Parse and return it.
            let (service, label_end) = read_name(buffer, offset)?;
            offset = label_end;

            answers.push(Answer::Ptr(PtrAnswer { label, service, ttl }));
        },
        Ok(Type::TXT) =>
        {
            // We got a TXT record. Parse and return it.
            let mut records: Vec<String> = Vec::new();

            let end = offset + answer_data_len;
            while offset < end
            {
                let txt_len = read_u8(buffer, offset)? as usize;
                offset += 1;

                if offset + txt_len > end
                {
                    return Err(ZeroConfError::InvalidRecord);
                }

                let txt = match std::str::from_utf8(&buffer[offset..offset + txt_len])
                {
                    Ok(s) => s,
                    Err(_) => return Err(ZeroConfError::InvalidUtf8)
                };

                records.push(txt.to_string());

                offset += txt_len;
            }

            answers.push(Answer::Txt(TxtAnswer { label, records, ttl, cache_flush }));
        },
        _ =>
        {
            // A record type we don't track. Skip it.
            offset += answer_data_len;
        }
    }

    Ok(offset)
}

fn read_name(buffer: &[u8], start_offset: usize) -> Result<(String, usize), ZeroConfError>
{
    let mut name = String::new();
    let mut offset = start_offset;
    let mut ptr_budget = MAX_COMPRESSION_POINTERS;
    let mut ptr_taken = false;
    let mut end_offset: usize = start_offset;

    loop
    {
        match read_u8(buffer, offset)? & 0xc0
        {
            0x00 =>
            {
                if buffer[offset] == 0x00
                {
                    // End of name, set offset to next thing.
                    if !ptr_taken
                    {
                        end_offset = offset + 1;
                    }

                    break;
                }

                let label_len = buffer[offset] as usize;
                offset += 1;

                if offset + label_len >= buffer.len()
                {
                    return Err(ZeroConfError::LabelTooLong);
                }

                name += match std::str::from_utf8(&buffer[offset..offset + label_len])
                {
                    Ok(s) => s,
                    Err(_) => return Err(ZeroConfError::InvalidUtf8)
                };

                offset += label_len;
                if buffer[offset] != 0x00
                {
                    name += ".";
                }
            },
            0xc0 =>
            {
                // Compression pointer.
                if ptr_budget == 0
                {
                    return Err(ZeroConfError::LabelCompressionLoop);
                }

                ptr_budget -= 1;

                let ptr = (read_u16(buffer, offset)? ^ 0xc000) as usize;
                if ptr >= offset
                {
                    return Err(ZeroConfError::LabelPtrForward);
                }

                if !ptr_taken
                {
                    end_offset = offset + 2;
                    ptr_taken = true;
                }

                offset = ptr;
            },
            _ =>
            {
                return Err(ZeroConfError::LabelInvalid);
            }
        }
    }

    Ok((name, end_offset))
}

fn push_name(buffer: &mut Vec<u8>, name: &str) -> Result<(), ZeroConfError>
{
    if name.is_empty()
    {
        return Err(ZeroConfError::LabelInvalid);
    }

    for label in name.split('.')
    {
        if label.is_empty()
        {
            continue;
        }

        if label.len() > MAX_LABEL_LEN
        {
            return Err(ZeroConfError::LabelTooLong);
        }

        buffer.push(label.len() as u8);
        buffer.extend_from_slice(label.as_bytes());
    }
    buffer.push(0x00);

    Ok(())
}

fn push_record(buffer: &mut Vec<u8>, answer: &Answer) -> Result<(), ZeroConfError>
{
    let mut rdata = Vec::new();
    let record_type;
    let mut record_class = CLASS_IN;
    let ttl;

    match answer
    {
        Answer::Ptr(ptr) =>
        {
            push_name(buffer, &ptr.label)?;
            record_type = Type::PTR;
            ttl = ptr.ttl;
            push_name(&mut rdata, &ptr.service)?;
        },
        Answer::Srv(srv) =>
        {
            push_name(buffer, &srv.label)?;
            record_type = Type::SRV;
            ttl = srv.ttl;
            if srv.cache_flush
            {
                record_class |= CLASS_TOP_BIT;
            }

            // Priority and weight are always zero for mDNS announcements.
            rdata.extend_from_slice(&0u16.to_be_bytes());
            rdata.extend_from_slice(&0u16.to_be_bytes());
            rdata.extend_from_slice(&srv.port.to_be_bytes());
            push_name(&mut rdata, &srv.target)?;
        },
        Answer::Txt(txt) =>
        {
            push_name(buffer, &txt.label)?;
            record_type = Type::TXT;
            ttl = txt.ttl;
            if txt.cache_flush
            {
                record_class |= CLASS_TOP_BIT;
            }

            if txt.records.is_empty()
            {
                // A TXT record carries at least one string, possibly empty.
                rdata.push(0x00);
            }

            for record in txt.records.iter()
            {
                if record.len() > MAX_TXT_STRING_LEN
                {
                    return Err(ZeroConfError::InvalidRecord);
                }

                rdata.push(record.len() as u8);
                rdata.extend_from_slice(record.as_bytes());
            }
        },
        Answer::A(a) =>
        {
            push_name(buffer, &a.label)?;
            record_type = Type::A;
            ttl = a.ttl;
            if a.cache_flush
            {
                record_class |= CLASS_TOP_BIT;
            }

            rdata.extend_from_slice(&a.address.octets());
        },
        Answer::Aaaa(aaaa) =>
        {
            push_name(buffer, &aaaa.label)?;
            record_type = Type::AAAA;
            ttl = aaaa.ttl;
            if aaaa.cache_flush
            {
                record_class |= CLASS_TOP_BIT;
            }

            rdata.extend_from_slice(&aaaa.address.octets());
        }
    }

    buffer.extend_from_slice(&(record_type as u16).to_be_bytes());
    buffer.extend_from_slice(&record_class.to_be_bytes());
    buffer.extend_from_slice(&ttl.to_be_bytes());
    buffer.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    buffer.extend_from_slice(&rdata);

    Ok(())
}

/// Continuous-query packet for a service type: one PTR question plus the
/// known answers the cache says are not worth asking for again.
pub fn new_query(service: &str, known_answers: &[Answer]) -> Result<Vec<u8>, ZeroConfError>
{
    if service.is_empty()
    {
        return Err(ZeroConfError::LabelInvalid);
    }

    let mut buffer = Vec::new();

    let header = DnsHeader
    {
        id: 0,
        flags: 0x0000,
        queries_len: 1,
        answers_len: known_answers.len() as u16,
        authorities_len: 0,
        additional_len: 0
    };

    buffer.extend(header.to_bytes());

    push_name(&mut buffer, service)?;

    // Question type PTR, class IN, multicast response.
    buffer.extend_from_slice(&(Type::PTR as u16).to_be_bytes());
    buffer.extend_from_slice(&CLASS_IN.to_be_bytes());

    for answer in known_answers
    {
        push_record(&mut buffer, answer)?;
    }

    Ok(buffer)
}

/// Probe packet for a proposed instance name: an ANY question with the
/// proposed SRV and TXT data in the authority section.
pub fn new_probe(instance: &str, target: &str, port: u16, txt_records: &[String], ttl: u32) -> Result<Vec<u8>, ZeroConfError>
{
    if instance.is_empty()
    {
        return Err(ZeroConfError::LabelInvalid);
    }

    let mut buffer = Vec::new();

    let header = DnsHeader
    {
        id: 0,
        flags: 0x0000,
        queries_len: 1,
        answers_len: 0,
        authorities_len: 2,
        additional_len: 0
    };

    buffer.extend(header.to_bytes());

    push_name(&mut buffer, instance)?;

    // Question type ANY, class IN.
    buffer.extend_from_slice(&(Type::ANY as u16).to_be_bytes());
    buffer.extend_from_slice(&CLASS_IN.to_be_bytes());

    push_record(&mut buffer, &Answer::Srv(SrvAnswer
    {
        label: instance.to_string(),
        target: target.to_string(),
        port,
        ttl,
        cache_flush: false
    }))?;

    push_record(&mut buffer, &Answer::Txt(TxtAnswer
    {
        label: instance.to_string(),
        records: txt_records.to_vec(),
        ttl,
        cache_flush: false
    }))?;

    Ok(buffer)
}

/// Authoritative response packet carrying the given records. Announcements,
/// query answers and goodbyes (TTL 0) all use this shape.
pub fn new_response(records: &[Answer]) -> Result<Vec<u8>, ZeroConfError>
{
    let mut buffer = Vec::new();

    let header = DnsHeader
    {
        id: 0,
        flags: FLAGS_QR_RESPONSE | FLAGS_AA,
        queries_len: 0,
        answers_len: records.len() as u16,
        authorities_len: 0,
        additional_len: 0
    };

    buffer.extend(header.to_bytes());

    for record in records
    {
        push_record(&mut buffer, record)?;
    }

    Ok(buffer)
}

impl Type
{
    pub fn from(value: u16) -> Result<Type, ZeroConfError>
    {
        match value
        {
            1 => Ok(Type::A),
            2 => Ok(Type::NS),
            5 => Ok(Type::CNAME),
            6 => Ok(Type::SOA),
            12 => Ok(Type::PTR),
            15 => Ok(Type::MX),
            16 => Ok(Type::TXT),
            28 => Ok(Type::AAAA),
            33 => Ok(Type::SRV),
            41 => Ok(Type::OPT),
            47 => Ok(Type::NSEC),
            255 => Ok(Type::ANY),
            _ => Err(ZeroConfError::InvalidRecord)
        }
    }
}

impl std::fmt::Display for Type
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Type::A => write!(f, "A"),
            Type::NS => write!(f, "NS"),
            Type::CNAME => write!(f, "CNAME"),
            Type::SOA => write!(f, "SOA"),
            Type::PTR => write!(f, "PTR"),
            Type::MX => write!(f, "MX"),
            Type::TXT => write!(f, "TXT"),
            Type::AAAA => write!(f, "AAAA"),
            Type::SRV => write!(f, "SRV"),
            Type::OPT => write!(f, "OPT"),
            Type::NSEC => write!(f, "NSEC"),
            Type::ANY => write!(f, "ANY")
        }
    }
}

impl std::fmt::Debug for Answer
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Answer::Ptr(answer) => write!(f, "PTR: {} -> {} (ttl {})", answer.label, answer.service, answer.ttl),
            Answer::Srv(answer) => write!(f, "SRV: {} -> {}:{} (ttl {})", answer.label, answer.target, answer.port, answer.ttl),
            Answer::Txt(answer) => write!(f, "TXT: {} -> {:?} (ttl {})", answer.label, answer.records, answer.ttl),
            Answer::A(answer) => write!(f, "A: {} -> {} (ttl {})", answer.label, answer.address, answer.ttl),
            Answer::Aaaa(answer) => write!(f, "AAAA: {} -> {} (ttl {})", answer.label, answer.address, answer.ttl)
        }
    }
}
